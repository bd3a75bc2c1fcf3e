//! Periodic reconciliation daemon (spec.md §4.5).
//!
//! Owns the GUID pool and the `guid -> podNetworkID` ownership map
//! exclusively: the watcher and event handler never touch them. Per
//! the "Recommended" design note (spec.md §5), the add and delete
//! passes run serially on one task, so these maps need only plain
//! mutexes that are never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::ExponentialBackoff;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ControllerError, Result};
use crate::events::EventHandler;
use crate::guid::{Guid, Pool};
use crate::k8s::K8sClient;
use crate::pod_network::{self, NetworkAttachment};
use crate::sm::{MembershipKind, SmPlugin};

type Pod = k8s_openapi::api::core::v1::Pod;

pub struct Reconciler {
    pool: Mutex<Pool>,
    guid_to_pod_network: Mutex<HashMap<Guid, String>>,
    // Reverse index for detecting reallocation of a pod-network's guid;
    // not part of the spec's data model, kept purely as bookkeeping.
    pod_network_to_guid: Mutex<HashMap<String, Guid>>,
    k8s: Arc<dyn K8sClient>,
    sm: Arc<dyn SmPlugin>,
    handler: Arc<EventHandler>,
    config: Config,
}

impl Reconciler {
    pub fn new(
        config: Config,
        k8s: Arc<dyn K8sClient>,
        sm: Arc<dyn SmPlugin>,
        handler: Arc<EventHandler>,
    ) -> Result<Self> {
        let pool = Pool::new(&config.guid_pool_range_start, &config.guid_pool_range_end)?;
        Ok(Self {
            pool: Mutex::new(pool),
            guid_to_pod_network: Mutex::new(HashMap::new()),
            pod_network_to_guid: Mutex::new(HashMap::new()),
            k8s,
            sm,
            handler,
            config,
        })
    }

    /// Daemon-wide default membership (spec.md §9 Open Question): enabling
    /// IP-over-IB cluster-wide requires full multicast membership, so it
    /// takes precedence over `default_limited_partition`. A per-attachment
    /// `cniArgs["pkey-membership"]` override (see
    /// [`pod_network::pkey_membership_override`]) takes precedence over both.
    fn default_membership(&self) -> MembershipKind {
        if self.config.enable_ip_over_ib {
            MembershipKind::Full
        } else if self.config.default_limited_partition {
            MembershipKind::Limited
        } else {
            MembershipKind::Full
        }
    }

    fn resolve_membership(&self, overrides: &[Option<bool>]) -> MembershipKind {
        for ov in overrides {
            match ov {
                Some(true) => return MembershipKind::Limited,
                Some(false) => return MembershipKind::Full,
                None => {}
            }
        }
        self.default_membership()
    }

    fn standard_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        }
    }

    fn bounded_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        }
    }

    fn release_and_forget(&self, guid: Guid) {
        let mut pool = self.pool.lock().unwrap();
        if let Err(e) = pool.release(guid) {
            warn!(guid = %guid, error = %e, "failed to release guid from pool");
        }
        drop(pool);
        self.guid_to_pod_network.lock().unwrap().remove(&guid);
    }

    // -- 4.5.1 Startup pool recovery ---------------------------------------

    pub async fn startup_recover(&self) -> Result<()> {
        let pods = backoff::future::retry(Self::standard_backoff(), || async {
            self.k8s.list_pods(None).await.map_err(|e| {
                warn!(error = %e, "list_pods failed during startup recovery, retrying");
                backoff::Error::transient(e)
            })
        })
        .await?;

        for pod in &pods {
            if pod_network::finished(pod) || !pod_network::has_network_attachment(pod) {
                continue;
            }
            let namespace = pod.namespace().unwrap_or_default();
            let uid = pod.uid().unwrap_or_default();
            let raw = pod
                .annotations()
                .get(pod_network::NETWORKS_ANNOTATION)
                .cloned()
                .unwrap_or_default();
            let nets = match pod_network::parse_networks_annotation(&raw) {
                Ok(nets) => nets,
                Err(e) => {
                    warn!(pod = %pod.name_any(), error = %e, "unparseable networks annotation during recovery, skipping pod");
                    continue;
                }
            };

            for net in &nets {
                let guid_str = match pod_network::get_guid(net) {
                    Ok(g) => g,
                    Err(_) => continue,
                };
                let guid = match Guid::parse(&guid_str) {
                    Ok(g) => g,
                    Err(e) => {
                        warn!(pod = %pod.name_any(), error = %e, "malformed guid during recovery, skipping");
                        continue;
                    }
                };
                let network_id = net.network_id(&namespace);
                let pn_id = pod_network::pod_network_id(&uid, &network_id);

                let outcome = self.pool.lock().unwrap().allocate(guid);
                match outcome {
                    Ok(()) => {
                        self.guid_to_pod_network.lock().unwrap().insert(guid, pn_id.clone());
                        self.pod_network_to_guid.lock().unwrap().insert(pn_id, guid);
                    }
                    Err(ControllerError::AlreadyAllocated(_)) => {
                        let owner = self.guid_to_pod_network.lock().unwrap().get(&guid).cloned();
                        if owner.as_deref() != Some(pn_id.as_str()) {
                            return Err(ControllerError::Conflict {
                                guid: guid.format(),
                                owner: owner.unwrap_or_default(),
                            });
                        }
                    }
                    Err(e) => {
                        warn!(pod = %pod.name_any(), guid = %guid, error = %e, "failed to reserve guid during recovery");
                    }
                }
            }
        }

        let sm_guids = backoff::future::retry(Self::standard_backoff(), || async {
            self.sm.list_guids_in_use().await.map_err(|e| {
                warn!(error = %e, "list_guids_in_use failed during startup recovery, retrying");
                backoff::Error::transient(e)
            })
        })
        .await?;

        let locally_tracked: Vec<Guid> = self.guid_to_pod_network.lock().unwrap().keys().copied().collect();
        for guid in locally_tracked {
            if sm_guids.contains_key(&guid.format()) {
                continue;
            }
            let released = self.pool.lock().unwrap().release(guid);
            match released {
                Ok(()) => {
                    self.guid_to_pod_network.lock().unwrap().remove(&guid);
                }
                Err(e) => {
                    warn!(guid = %guid, error = %e, "sm does not report this guid but pool release failed, preserving local state");
                }
            }
        }

        info!(
            recovered = self.guid_to_pod_network.lock().unwrap().len(),
            "startup pool recovery complete"
        );
        Ok(())
    }

    // -- 4.5.2 Periodic add reconciliation ---------------------------------

    pub async fn reconcile_add_tick(&self) {
        let batch = self.handler.add_queue.take_all().await;
        for (network_id, pods) in batch {
            self.process_add_network(&network_id, pods).await;
        }
    }

    async fn process_add_network(&self, network_id: &str, pods: Vec<Arc<Pod>>) {
        let Some((namespace, name)) = pod_network::split_network_id(network_id) else {
            warn!(network_id, "malformed network id, dropping");
            return;
        };

        let config_json = match self
            .k8s
            .get_network_attachment_definition_config(namespace, name)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(network_id, error = %e, "failed to fetch network-attachment-definition, requeueing");
                self.handler.add_queue.put_back(network_id.to_string(), pods).await;
                return;
            }
        };

        let spec = match pod_network::get_ib_sriov_spec(&config_json) {
            Ok(spec) => spec,
            Err(_) => {
                debug!(network_id, "not an ib-sriov network, dropping misrouted key");
                return;
            }
        };

        let pkey = match spec.pkey.as_deref().map(pod_network::parse_pkey).transpose() {
            Ok(p) => p,
            Err(e) => {
                warn!(network_id, error = %e, "invalid pkey, dropping key");
                return;
            }
        };

        let mut allocated: Vec<(Arc<Pod>, Guid, Vec<NetworkAttachment>)> = Vec::new();
        let mut membership_overrides: Vec<Option<bool>> = Vec::new();
        let mut stale_removals: Vec<Guid> = Vec::new();
        let mut failed_pods: Vec<Arc<Pod>> = Vec::new();

        for pod in pods {
            match self.allocate_for_pod(&pod, network_id, namespace) {
                Ok(Some((guid, nets, stale, membership_override))) => {
                    if let Some(old) = stale {
                        stale_removals.push(old);
                    }
                    membership_overrides.push(membership_override);
                    allocated.push((pod, guid, nets));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(network_id, pod = %pod.name_any(), error = %e, "add failed for pod, will retry next tick");
                    failed_pods.push(pod);
                }
            }
        }

        for old_guid in stale_removals {
            self.remove_stale_guid(old_guid, pkey).await;
        }

        if allocated.is_empty() {
            if !failed_pods.is_empty() {
                self.handler.add_queue.put_back(network_id.to_string(), failed_pods).await;
            }
            return;
        }

        if let Some(pkey) = pkey {
            let guids: Vec<String> = allocated.iter().map(|(_, g, _)| g.format()).collect();
            let membership = self.resolve_membership(&membership_overrides);
            if let Err(e) = self.sm.add_guids_to_pkey(pkey, &guids, membership).await {
                warn!(network_id, error = %e, "sm add_guids_to_pkey failed, requeueing whole batch");
                failed_pods.extend(allocated.into_iter().map(|(p, _, _)| p));
                self.handler.add_queue.put_back(network_id.to_string(), failed_pods).await;
                return;
            }
        }

        let mut removed_list: Vec<Guid> = Vec::new();
        for (pod, guid, nets) in allocated {
            let pod_namespace = pod.namespace().unwrap_or_default();
            let pod_name = pod.name_any();
            let annotation_value = match pod_network::format_networks_annotation(&nets) {
                Ok(v) => v,
                Err(e) => {
                    error!(pod = %pod_name, error = %e, "failed to encode networks annotation");
                    continue;
                }
            };
            let mut annotations = HashMap::new();
            annotations.insert(pod_network::NETWORKS_ANNOTATION.to_string(), annotation_value);

            match self
                .k8s
                .set_pod_annotations(&pod_namespace, &pod_name, annotations)
                .await
            {
                Ok(()) => {}
                Err(ControllerError::PodGone(_)) => {
                    info!(pod = %pod_name, guid = %guid, "pod gone before annotation write, releasing guid");
                    self.release_and_forget(guid);
                    removed_list.push(guid);
                }
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "annotation write failed, will retry next tick");
                    failed_pods.push(pod);
                }
            }
        }

        if !removed_list.is_empty() {
            if let Some(pkey) = pkey {
                let guids: Vec<String> = removed_list.iter().map(Guid::format).collect();
                if let Err(e) = self.sm.remove_guids_from_pkey(pkey, &guids).await {
                    warn!(network_id, error = %e, "sm remove_guids_from_pkey for dead pods failed, will reconcile later");
                }
            }
        }

        if !failed_pods.is_empty() {
            self.handler.add_queue.put_back(network_id.to_string(), failed_pods).await;
        }
    }

    /// Resolves the pod's network element, allocates or validates its GUID,
    /// and marks it configured. Returns `Ok(None)` if the network is already
    /// configured (nothing to do), and the stale guid from a prior
    /// allocation for the same pod-network instance when one is found.
    fn allocate_for_pod(
        &self,
        pod: &Arc<Pod>,
        network_id: &str,
        namespace: &str,
    ) -> Result<Option<(Guid, Vec<NetworkAttachment>, Option<Guid>, Option<bool>)>> {
        let raw = pod
            .annotations()
            .get(pod_network::NETWORKS_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        let mut nets = pod_network::parse_networks_annotation(&raw)?;
        let uid = pod.uid().unwrap_or_default();
        let pn_id = pod_network::pod_network_id(&uid, network_id);

        let idx = nets
            .iter()
            .position(|n| n.network_id(namespace) == network_id)
            .ok_or_else(|| {
                ControllerError::BadInput(format!("pod carries no network element for {network_id}"))
            })?;

        if pod_network::is_infiniband_configured(&nets[idx]) {
            return Ok(None);
        }

        let membership_override = pod_network::pkey_membership_override(&nets[idx]);

        let guid = match pod_network::get_guid(&nets[idx]) {
            Ok(existing) => {
                let guid = Guid::parse(&existing)?;
                let mut pool = self.pool.lock().unwrap();
                match pool.allocate(guid) {
                    Ok(()) => {}
                    Err(ControllerError::AlreadyAllocated(_)) => {
                        drop(pool);
                        let owner = self.guid_to_pod_network.lock().unwrap().get(&guid).cloned();
                        if owner.as_deref() != Some(pn_id.as_str()) {
                            return Err(ControllerError::Conflict {
                                guid: guid.format(),
                                owner: owner.unwrap_or_default(),
                            });
                        }
                    }
                    Err(e) => return Err(e),
                }
                guid
            }
            Err(_) => {
                let mut pool = self.pool.lock().unwrap();
                let guid = pool.generate()?;
                pool.allocate(guid)?;
                guid
            }
        };

        pod_network::set_guid(&mut nets[idx], &guid.format(), self.config.write_guid_as_runtime_config);
        pod_network::mark_configured(&mut nets[idx]);

        self.guid_to_pod_network.lock().unwrap().insert(guid, pn_id.clone());
        let stale = {
            let mut reverse = self.pod_network_to_guid.lock().unwrap();
            reverse.insert(pn_id, guid).filter(|old| *old != guid)
        };

        Ok(Some((guid, nets, stale, membership_override)))
    }

    /// §4.5.4: revokes a superseded guid at the Subnet Manager under
    /// bounded backoff before releasing it from the pool. Leaves the guid
    /// allocated if the SM call never succeeds.
    async fn remove_stale_guid(&self, guid: Guid, pkey: Option<u16>) {
        if let Some(pkey) = pkey {
            let guids = vec![guid.format()];
            let result = backoff::future::retry(Self::bounded_backoff(), || async {
                self.sm.remove_guids_from_pkey(pkey, &guids).await.map_err(backoff::Error::transient)
            })
            .await;
            if let Err(e) = result {
                error!(guid = %guid, error = %e, "failed to remove stale guid from sm after retries, leaving allocated");
                return;
            }
        }
        self.release_and_forget(guid);
    }

    // -- 4.5.3 Periodic delete reconciliation -------------------------------

    pub async fn reconcile_delete_tick(&self) {
        let batch = self.handler.delete_queue.take_all().await;
        for (network_id, pods) in batch {
            self.process_delete_network(&network_id, pods).await;
        }
    }

    async fn process_delete_network(&self, network_id: &str, pods: Vec<Arc<Pod>>) {
        let Some((namespace, name)) = pod_network::split_network_id(network_id) else {
            warn!(network_id, "malformed network id, dropping");
            return;
        };

        let config_json = match self
            .k8s
            .get_network_attachment_definition_config(namespace, name)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(network_id, error = %e, "failed to fetch network-attachment-definition, requeueing delete batch");
                self.handler.delete_queue.put_back(network_id.to_string(), pods).await;
                return;
            }
        };

        let spec = match pod_network::get_ib_sriov_spec(&config_json) {
            Ok(spec) => spec,
            Err(_) => return,
        };

        let pkey = match spec.pkey.as_deref().map(pod_network::parse_pkey).transpose() {
            Ok(p) => p,
            Err(e) => {
                warn!(network_id, error = %e, "invalid pkey, dropping delete key");
                return;
            }
        };

        let mut resolved: Vec<(Guid, String)> = Vec::new();
        let mut failed_pods: Vec<Arc<Pod>> = Vec::new();

        for pod in pods {
            let raw = pod
                .annotations()
                .get(pod_network::NETWORKS_ANNOTATION)
                .cloned()
                .unwrap_or_default();
            let nets = match pod_network::parse_networks_annotation(&raw) {
                Ok(nets) => nets,
                Err(e) => {
                    warn!(pod = %pod.name_any(), error = %e, "unparseable networks annotation, will retry");
                    failed_pods.push(pod);
                    continue;
                }
            };
            let net = match nets.iter().find(|n| n.network_id(namespace) == network_id) {
                Some(n) => n,
                None => {
                    failed_pods.push(pod);
                    continue;
                }
            };
            if !pod_network::is_infiniband_configured(net) {
                continue;
            }
            let guid_str = match pod_network::get_guid(net) {
                Ok(g) => g,
                Err(_) => continue,
            };
            let guid = match Guid::parse(&guid_str) {
                Ok(g) => g,
                Err(_) => continue,
            };
            let uid = pod.uid().unwrap_or_default();
            let pn_id = pod_network::pod_network_id(&uid, network_id);
            resolved.push((guid, pn_id));
        }

        if resolved.is_empty() {
            if !failed_pods.is_empty() {
                self.handler.delete_queue.put_back(network_id.to_string(), failed_pods).await;
            }
            return;
        }

        if let Some(pkey) = pkey {
            let guids: Vec<String> = resolved.iter().map(|(g, _)| g.format()).collect();
            if let Err(e) = self.sm.remove_guids_from_pkey(pkey, &guids).await {
                warn!(network_id, error = %e, "sm remove_guids_from_pkey failed, requeueing delete batch");
                self.handler.delete_queue.put_back(network_id.to_string(), failed_pods).await;
                return;
            }
        }

        for (guid, pn_id) in resolved {
            self.release_and_forget(guid);
            self.pod_network_to_guid.lock().unwrap().remove(&pn_id);
        }

        if !failed_pods.is_empty() {
            self.handler.delete_queue.put_back(network_id.to_string(), failed_pods).await;
        }
    }

    /// Drives both periodic passes on a single task (spec.md §5,
    /// "Recommended": alternating add then delete on one task keeps pool
    /// access lock-free). Runs until `token` is cancelled.
    pub async fn run_periodic(self: Arc<Self>, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("reconciler loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.reconcile_add_tick().await;
                    self.reconcile_delete_tick().await;
                }
            }
        }
    }

    #[cfg(test)]
    pub fn allocated_count(&self) -> usize {
        self.pool.lock().unwrap().allocated_count()
    }

    #[cfg(test)]
    pub fn is_tracked(&self, guid: &str) -> bool {
        let guid = Guid::parse(guid).unwrap();
        self.guid_to_pod_network.lock().unwrap().contains_key(&guid)
    }
}
