//! Kubernetes client surface (spec.md §4.6, §6).
//!
//! `K8sClient` is a narrow async trait covering exactly the calls the
//! reconciler needs: listing pods, reading a network-attachment-
//! definition's embedded CNI config, and patching pod annotations.
//! Keeping it a trait lets tests substitute [`mock::MockK8sClient`]
//! instead of standing up an API server. The watcher talks to the
//! cluster directly through a `kube::Client`, obtained from
//! [`KubeClient::raw`] — it needs informer machinery the trait does
//! not expose.

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

const FIELD_MANAGER: &str = "ibguid-controller";

/// `k8s.cni.cncf.io/v1` `NetworkAttachmentDefinition`, as installed by Multus.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    plural = "network-attachment-definitions",
    namespaced
)]
pub struct NetworkAttachmentDefinitionSpec {
    /// CNI chain or single-plugin JSON blob.
    #[serde(default)]
    pub config: String,
}

/// The narrow surface the reconciler needs from the Kubernetes API.
#[async_trait]
pub trait K8sClient: Send + Sync {
    /// Lists pods in `namespace`, or cluster-wide when `None` (used by
    /// startup pool recovery).
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>>;

    /// Fetches the raw `spec.config` of a network-attachment-definition.
    async fn get_network_attachment_definition_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String>;

    /// Merge-patches annotations onto a pod. Returns [`ControllerError::PodGone`]
    /// if the pod no longer exists.
    async fn set_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: HashMap<String, String>,
    ) -> Result<()>;
}

/// Production [`K8sClient`] backed by a real cluster connection.
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ControllerError::Config(format!("failed to build kube client: {e}")))?;
        Ok(Self { client })
    }

    /// Exposes the underlying client for the watcher's informer construction.
    pub fn raw(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl K8sClient for KubeClient {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_network_attachment_definition_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String> {
        let api: Api<NetworkAttachmentDefinition> = Api::namespaced(self.client.clone(), namespace);
        let nad = api.get(name).await?;
        Ok(nad.spec.config)
    }

    async fn set_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: HashMap<String, String>,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations }
        });

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER);
        if let Err(e) = api.patch(name, &params, &Patch::Merge(&patch)).await {
            if let kube::Error::Api(resp) = &e {
                if resp.code == 404 {
                    return Err(ControllerError::PodGone(name.to_string()));
                }
            }
            return Err(ControllerError::K8s(e));
        }
        Ok(())
    }
}
