//! In-memory [`K8sClient`] for reconciler and event-handler tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use super::K8sClient;
use crate::error::{ControllerError, Result};

/// Records patches instead of applying them against a real cluster, and
/// serves pods / network-attachment-definition configs from fixed tables.
pub struct MockK8sClient {
    pods: Mutex<Vec<Pod>>,
    nad_configs: Mutex<HashMap<String, String>>,
    patches: Mutex<Vec<(String, String, HashMap<String, String>)>>,
    fail_patches_for: Mutex<Vec<String>>,
    gone_pods: Mutex<Vec<String>>,
}

impl MockK8sClient {
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(Vec::new()),
            nad_configs: Mutex::new(HashMap::new()),
            patches: Mutex::new(Vec::new()),
            fail_patches_for: Mutex::new(Vec::new()),
            gone_pods: Mutex::new(Vec::new()),
        }
    }

    pub fn seed_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn set_nad_config(&self, namespace: &str, name: &str, config: &str) {
        self.nad_configs
            .lock()
            .unwrap()
            .insert(format!("{namespace}/{name}"), config.to_string());
    }

    pub fn fail_patch_for(&self, pod_name: &str) {
        self.fail_patches_for.lock().unwrap().push(pod_name.to_string());
    }

    pub fn mark_pod_gone(&self, pod_name: &str) {
        self.gone_pods.lock().unwrap().push(pod_name.to_string());
    }

    pub fn patches(&self) -> Vec<(String, String, HashMap<String, String>)> {
        self.patches.lock().unwrap().clone()
    }
}

impl Default for MockK8sClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl K8sClient for MockK8sClient {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>> {
        let pods = self.pods.lock().unwrap();
        Ok(match namespace {
            Some(ns) => pods
                .iter()
                .filter(|p| p.namespace().as_deref() == Some(ns))
                .cloned()
                .collect(),
            None => pods.clone(),
        })
    }

    async fn get_network_attachment_definition_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String> {
        self.nad_configs
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or_else(|| {
                ControllerError::BadInput(format!(
                    "no such network-attachment-definition: {namespace}/{name}"
                ))
            })
    }

    async fn set_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: HashMap<String, String>,
    ) -> Result<()> {
        if self.gone_pods.lock().unwrap().contains(&name.to_string()) {
            return Err(ControllerError::PodGone(name.to_string()));
        }
        if self.fail_patches_for.lock().unwrap().contains(&name.to_string()) {
            return Err(ControllerError::Sm("injected patch failure".to_string()));
        }
        self.patches
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string(), annotations));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[tokio::test]
    async fn records_successful_patch() {
        let client = MockK8sClient::new();
        let mut annotations = Map::new();
        annotations.insert("k8s.v1.cni.cncf.io/networks".to_string(), "[]".to_string());
        client
            .set_pod_annotations("default", "pod-a", annotations)
            .await
            .unwrap();
        assert_eq!(client.patches().len(), 1);
    }

    #[tokio::test]
    async fn fails_patch_for_gone_pod() {
        let client = MockK8sClient::new();
        client.mark_pod_gone("pod-a");
        let result = client
            .set_pod_annotations("default", "pod-a", Map::new())
            .await;
        assert!(matches!(result, Err(ControllerError::PodGone(_))));
    }

    #[tokio::test]
    async fn serves_configured_nad() {
        let client = MockK8sClient::new();
        client.set_nad_config("default", "ib-net", r#"{"type":"ib-sriov"}"#);
        let config = client
            .get_network_attachment_definition_config("default", "ib-net")
            .await
            .unwrap();
        assert_eq!(config, r#"{"type":"ib-sriov"}"#);
    }
}
