//! Pod-network annotation utilities (spec.md §4.2).
//!
//! Everything here is pure data transformation: reading/writing the
//! `k8s.v1.cni.cncf.io/networks` annotation payload and the
//! network-attachment-definition's embedded CNI config. No I/O.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ControllerError, Result};

pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
const CONFIGURED_MARKER_KEY: &str = "mellanox.infiniband.app";
const CONFIGURED_MARKER_VALUE: &str = "configured";

/// One entry of the `k8s.v1.cni.cncf.io/networks` JSON array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkAttachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, rename = "cni-args", skip_serializing_if = "Option::is_none")]
    pub cni_args: Option<HashMap<String, Value>>,
    #[serde(default, rename = "infiniband-guid-request", skip_serializing_if = "Option::is_none")]
    pub infiniband_guid_request: Option<String>,
}

impl NetworkAttachment {
    pub fn network_id(&self, pod_namespace: &str) -> String {
        let ns = self.namespace.as_deref().unwrap_or(pod_namespace);
        network_id(ns, &self.name)
    }
}

/// `"<namespace>_<name>"`, the key used by all work queues.
pub fn network_id(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}

/// `string(pod.uid) + networkID`, the unit of GUID ownership.
pub fn pod_network_id(pod_uid: &str, network_id: &str) -> String {
    format!("{pod_uid}{network_id}")
}

/// Recovers `(namespace, name)` from a `"<namespace>_<name>"` key.
/// Kubernetes namespace names are DNS labels and cannot contain
/// underscores, so splitting on the first one is unambiguous.
pub fn split_network_id(network_id: &str) -> Option<(&str, &str)> {
    network_id.split_once('_')
}

/// Parses the `k8s.v1.cni.cncf.io/networks` annotation value.
pub fn parse_networks_annotation(raw: &str) -> Result<Vec<NetworkAttachment>> {
    serde_json::from_str(raw)
        .map_err(|e| ControllerError::BadInput(format!("invalid networks annotation: {e}")))
}

pub fn format_networks_annotation(nets: &[NetworkAttachment]) -> Result<String> {
    serde_json::to_string(nets)
        .map_err(|e| ControllerError::BadInput(format!("failed to encode networks annotation: {e}")))
}

/// Prefers `infiniband_guid_request`, falls back to `cni_args["guid"]`.
pub fn get_guid(net: &NetworkAttachment) -> Result<String> {
    if let Some(g) = &net.infiniband_guid_request {
        if !g.is_empty() {
            return Ok(g.clone());
        }
    }
    if let Some(args) = &net.cni_args {
        if let Some(Value::String(g)) = args.get("guid") {
            if !g.is_empty() {
                return Ok(g.clone());
            }
        }
    }
    Err(ControllerError::BadInput(format!(
        "network {} carries no guid",
        net.name
    )))
}

/// Writes `guid` to the runtime-config field if `as_runtime_config`, else into `cni_args["guid"]`.
pub fn set_guid(net: &mut NetworkAttachment, guid: &str, as_runtime_config: bool) {
    if as_runtime_config {
        net.infiniband_guid_request = Some(guid.to_string());
    } else {
        let args = net.cni_args.get_or_insert_with(HashMap::new);
        args.insert("guid".to_string(), Value::String(guid.to_string()));
    }
}

/// Marks the network element as having completed IB-SR-IOV configuration.
pub fn mark_configured(net: &mut NetworkAttachment) {
    let args = net.cni_args.get_or_insert_with(HashMap::new);
    args.insert(
        CONFIGURED_MARKER_KEY.to_string(),
        Value::String(CONFIGURED_MARKER_VALUE.to_string()),
    );
}

/// Optional per-attachment override of PKey membership, read from
/// `cni_args["pkey-membership"]` (`"full"` or `"limited"`). `None` when
/// absent or unrecognized, in which case the daemon-wide default applies
/// (spec.md §9 Open Question on `EnableIPOverIB`/`DefaultLimitedPartition`).
/// `Some(true)` means limited, `Some(false)` means full.
pub fn pkey_membership_override(net: &NetworkAttachment) -> Option<bool> {
    let raw = net.cni_args.as_ref()?.get("pkey-membership")?.as_str()?;
    match raw.to_ascii_lowercase().as_str() {
        "limited" => Some(true),
        "full" => Some(false),
        _ => None,
    }
}

pub fn is_infiniband_configured(net: &NetworkAttachment) -> bool {
    net.cni_args
        .as_ref()
        .and_then(|args| args.get(CONFIGURED_MARKER_KEY))
        .and_then(Value::as_str)
        == Some(CONFIGURED_MARKER_VALUE)
}

/// `{ type: "ib-sriov", pkey? }` as embedded in a network-attachment-definition's `spec.config`.
#[derive(Debug, Clone, PartialEq)]
pub struct IbSriovSpec {
    pub plugin_type: String,
    pub pkey: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCniPlugin {
    #[serde(rename = "type")]
    plugin_type: String,
    #[serde(default)]
    pkey: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCniChain {
    #[serde(default)]
    plugins: Option<Vec<RawCniPlugin>>,
}

const IB_SRIOV_TYPE: &str = "ib-sriov";

/// Accepts either a single-plugin config (`type == "ib-sriov"`) or a CNI
/// chain (`plugins: [...]`), returning the first `ib-sriov` entry.
pub fn get_ib_sriov_spec(config_json: &str) -> Result<IbSriovSpec> {
    let single: std::result::Result<RawCniPlugin, _> = serde_json::from_str(config_json);
    if let Ok(plugin) = single {
        if plugin.plugin_type == IB_SRIOV_TYPE {
            return Ok(IbSriovSpec {
                plugin_type: plugin.plugin_type,
                pkey: plugin.pkey,
            });
        }
    }

    let chain: RawCniChain = serde_json::from_str(config_json)
        .map_err(|e| ControllerError::BadInput(format!("invalid cni config: {e}")))?;
    if let Some(plugins) = chain.plugins {
        if let Some(p) = plugins.into_iter().find(|p| p.plugin_type == IB_SRIOV_TYPE) {
            return Ok(IbSriovSpec {
                plugin_type: p.plugin_type,
                pkey: p.pkey,
            });
        }
    }

    Err(ControllerError::NotIbSriov(config_json.to_string()))
}

/// `0x`-prefixed hex, 15-bit value in `0x0001..=0xFFFE`.
pub fn parse_pkey(s: &str) -> Result<u16> {
    let hex = s
        .strip_prefix("0x")
        .ok_or_else(|| ControllerError::BadInput(format!("pkey must be 0x-prefixed: {s}")))?;
    let value = u32::from_str_radix(hex, 16)
        .map_err(|_| ControllerError::BadInput(format!("invalid pkey hex: {s}")))?;
    if value == 0 || value > 0xFFFE {
        return Err(ControllerError::BadInput(format!(
            "pkey {s} out of the 15-bit range 0x0001..0xFFFE"
        )));
    }
    Ok(value as u16)
}

// -- Pod classifiers --------------------------------------------------------

pub fn wants_network(pod: &Pod) -> bool {
    !pod.spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false)
}

pub fn scheduled(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .map(|n| !n.is_empty())
        .unwrap_or(false)
}

pub fn running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

pub fn finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

pub fn has_network_attachment(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(NETWORKS_ANNOTATION))
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_guid_prefers_runtime_config() {
        let mut args = HashMap::new();
        args.insert("guid".to_string(), Value::String("fallback".into()));
        let net = NetworkAttachment {
            name: "ib".into(),
            namespace: None,
            cni_args: Some(args),
            infiniband_guid_request: Some("preferred".into()),
        };
        assert_eq!(get_guid(&net).unwrap(), "preferred");
    }

    #[test]
    fn get_guid_falls_back_to_cni_args() {
        let mut args = HashMap::new();
        args.insert("guid".to_string(), Value::String("from-args".into()));
        let net = NetworkAttachment {
            name: "ib".into(),
            namespace: None,
            cni_args: Some(args),
            infiniband_guid_request: None,
        };
        assert_eq!(get_guid(&net).unwrap(), "from-args");
    }

    #[test]
    fn get_guid_errors_when_absent() {
        let net = NetworkAttachment {
            name: "ib".into(),
            namespace: None,
            cni_args: None,
            infiniband_guid_request: None,
        };
        assert!(get_guid(&net).is_err());
    }

    #[test]
    fn set_guid_into_cni_args_creates_map() {
        let mut net = NetworkAttachment {
            name: "ib".into(),
            namespace: None,
            cni_args: None,
            infiniband_guid_request: None,
        };
        set_guid(&mut net, "02:00:00:00:00:00:00:01", false);
        assert_eq!(get_guid(&net).unwrap(), "02:00:00:00:00:00:00:01");
    }

    #[test]
    fn configured_marker_round_trips() {
        let mut net = NetworkAttachment {
            name: "ib".into(),
            namespace: None,
            cni_args: None,
            infiniband_guid_request: None,
        };
        assert!(!is_infiniband_configured(&net));
        mark_configured(&mut net);
        assert!(is_infiniband_configured(&net));
    }

    #[test]
    fn ib_sriov_spec_from_top_level_config() {
        let json = r#"{"type":"ib-sriov","pkey":"0x1000"}"#;
        let spec = get_ib_sriov_spec(json).unwrap();
        assert_eq!(spec.plugin_type, "ib-sriov");
        assert_eq!(spec.pkey.as_deref(), Some("0x1000"));
    }

    #[test]
    fn ib_sriov_spec_from_chained_config() {
        let json = r#"{"plugins":[{"type":"bridge"},{"type":"ib-sriov","pkey":"0x2000"}]}"#;
        let spec = get_ib_sriov_spec(json).unwrap();
        assert_eq!(spec.pkey.as_deref(), Some("0x2000"));
    }

    #[test]
    fn ib_sriov_spec_absent_is_not_ib_sriov() {
        let json = r#"{"type":"bridge"}"#;
        assert!(matches!(
            get_ib_sriov_spec(json),
            Err(ControllerError::NotIbSriov(_))
        ));
    }

    #[test]
    fn pkey_boundaries() {
        assert!(parse_pkey("0x0000").is_err());
        assert!(parse_pkey("0xFFFF").is_err());
        assert_eq!(parse_pkey("0x0001").unwrap(), 1);
        assert_eq!(parse_pkey("0xFFFE").unwrap(), 0xFFFE);
    }

    #[test]
    fn pkey_requires_prefix() {
        assert!(parse_pkey("1000").is_err());
    }

    #[test]
    fn pkey_membership_override_reads_cni_args() {
        let mut args = HashMap::new();
        args.insert("pkey-membership".to_string(), Value::String("limited".into()));
        let net = NetworkAttachment {
            name: "ib".into(),
            namespace: None,
            cni_args: Some(args),
            infiniband_guid_request: None,
        };
        assert_eq!(pkey_membership_override(&net), Some(true));

        let mut args = HashMap::new();
        args.insert("pkey-membership".to_string(), Value::String("full".into()));
        let net = NetworkAttachment {
            name: "ib".into(),
            namespace: None,
            cni_args: Some(args),
            infiniband_guid_request: None,
        };
        assert_eq!(pkey_membership_override(&net), Some(false));
    }

    #[test]
    fn pkey_membership_override_absent_is_none() {
        let net = NetworkAttachment {
            name: "ib".into(),
            namespace: None,
            cni_args: None,
            infiniband_guid_request: None,
        };
        assert_eq!(pkey_membership_override(&net), None);
    }

    #[test]
    fn network_id_and_pod_network_id_format() {
        assert_eq!(network_id("default", "ib"), "default_ib");
        assert_eq!(pod_network_id("u1", "default_ib"), "u1default_ib");
    }

    #[test]
    fn split_network_id_recovers_namespace_and_name() {
        assert_eq!(split_network_id("default_ib"), Some(("default", "ib")));
        assert_eq!(split_network_id("kube-system_storage-net"), Some(("kube-system", "storage-net")));
        assert_eq!(split_network_id("no-underscore"), None);
    }
}
