//! Event handler: classifies watcher callbacks into pending-add and
//! pending-delete work queues keyed by network identity (spec.md §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::pod_network::{
    self, has_network_attachment, is_infiniband_configured, parse_networks_annotation, running,
    scheduled, wants_network,
};

/// A typed `networkID -> Vec<Pod>` map with an explicit exclusive-access
/// operation for the reconciler tick (Design Note "Thread-safe map").
#[derive(Default)]
pub struct PendingMap {
    inner: RwLock<HashMap<String, Vec<Arc<Pod>>>>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `pod` to the list for `network_id`, preserving order of appearance.
    pub async fn push(&self, network_id: String, pod: Arc<Pod>) {
        let mut inner = self.inner.write().await;
        inner.entry(network_id).or_default().push(pod);
    }

    /// Takes the entire map for a reconciler tick, leaving an empty map behind.
    pub async fn take_all(&self) -> HashMap<String, Vec<Arc<Pod>>> {
        let mut inner = self.inner.write().await;
        std::mem::take(&mut *inner)
    }

    /// Re-inserts a residual batch after a partial-failure tick, preserving
    /// any entries added concurrently by the watcher.
    pub async fn put_back(&self, network_id: String, pods: Vec<Arc<Pod>>) {
        if pods.is_empty() {
            return;
        }
        let mut inner = self.inner.write().await;
        inner.entry(network_id).or_default().extend(pods);
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> HashMap<String, Vec<Arc<Pod>>> {
        self.inner.read().await.clone()
    }
}

/// Event handler state shared between the watcher and the reconciler.
pub struct EventHandler {
    retry_set: RwLock<std::collections::HashSet<String>>,
    pub add_queue: PendingMap,
    pub delete_queue: PendingMap,
}

impl EventHandler {
    pub fn new() -> Self {
        Self {
            retry_set: RwLock::new(std::collections::HashSet::new()),
            add_queue: PendingMap::new(),
            delete_queue: PendingMap::new(),
        }
    }

    pub async fn on_add(&self, pod: Arc<Pod>) {
        if !wants_network(&pod) || running(&pod) || pod_network::finished(&pod) || !has_network_attachment(&pod) {
            return;
        }

        if !scheduled(&pod) {
            self.retry_set.write().await.insert(pod.uid().unwrap_or_default());
            return;
        }

        let _ = self.enqueue_add(pod).await;
    }

    /// Parses the pod's networks annotation and enqueues each unconfigured
    /// entry. Returns `false` (and leaves `uid` in `retry_set`) on a parse
    /// failure, so callers must not clear the retry marker on a `false`
    /// result — the pod still needs to be retried, not dropped.
    async fn enqueue_add(&self, pod: Arc<Pod>) -> bool {
        let uid = pod.uid().unwrap_or_default();
        let raw = pod
            .annotations()
            .get(pod_network::NETWORKS_ANNOTATION)
            .cloned()
            .unwrap_or_default();

        let nets = match parse_networks_annotation(&raw) {
            Ok(nets) => nets,
            Err(e) => {
                warn!(pod = %pod.name_any(), error = %e, "failed to parse networks annotation, will retry");
                self.retry_set.write().await.insert(uid);
                return false;
            }
        };

        let namespace = pod.namespace().unwrap_or_default();
        for net in &nets {
            if is_infiniband_configured(net) {
                continue;
            }
            let network_id = net.network_id(&namespace);
            self.add_queue.push(network_id, pod.clone()).await;
        }
        true
    }

    pub async fn on_update(&self, _old_pod: Arc<Pod>, new_pod: Arc<Pod>) {
        if running(&new_pod) {
            self.retry_set.write().await.remove(&new_pod.uid().unwrap_or_default());
            return;
        }

        if pod_network::finished(&new_pod) {
            self.on_delete(new_pod).await;
            return;
        }

        let uid = new_pod.uid().unwrap_or_default();
        let is_retrying = self.retry_set.read().await.contains(&uid);
        if is_retrying && scheduled(&new_pod) {
            let parsed = self.enqueue_add(new_pod.clone()).await;
            if parsed {
                self.retry_set.write().await.remove(&uid);
            }
        }
    }

    pub async fn on_delete(&self, pod: Arc<Pod>) {
        let uid = pod.uid().unwrap_or_default();
        self.retry_set.write().await.remove(&uid);

        if !wants_network(&pod) || !has_network_attachment(&pod) {
            return;
        }

        let raw = pod
            .annotations()
            .get(pod_network::NETWORKS_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        let nets = match parse_networks_annotation(&raw) {
            Ok(nets) => nets,
            Err(e) => {
                warn!(pod = %pod.name_any(), error = %e, "failed to parse networks annotation on delete");
                return;
            }
        };

        let namespace = pod.namespace().unwrap_or_default();
        for net in &nets {
            if !is_infiniband_configured(net) {
                continue;
            }
            if pod_network::get_guid(net).is_err() {
                debug!(pod = %pod.name_any(), network = %net.name, "configured network has no guid, skipping");
                continue;
            }
            let network_id = net.network_id(&namespace);
            self.delete_queue.push(network_id, pod.clone()).await;
        }
    }
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}
