//! Typed error kinds shared across the controller (spec.md §7).
//!
//! Each variant corresponds to one row of the error-kind policy table;
//! callers match on variant to decide retry/requeue/skip behavior
//! rather than inspecting message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Invalid configuration or unknown plugin. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Kubernetes API call failed after exhausting retries.
    #[error("kubernetes API error: {0}")]
    K8s(#[from] kube::Error),

    /// Subnet Manager call failed after exhausting retries.
    #[error("subnet manager error: {0}")]
    Sm(String),

    /// A patch targeted a pod that no longer exists.
    #[error("pod gone: {0}")]
    PodGone(String),

    /// GUID already owned by a different pod-network instance.
    #[error("guid {guid} already allocated to {owner}")]
    Conflict { guid: String, owner: String },

    /// User-specified GUID outside the configured pool range.
    #[error("guid {0} out of pool range")]
    OutOfRange(String),

    /// Pool has no free GUIDs left to allocate.
    #[error("guid pool exhausted")]
    PoolExhausted,

    /// Pool already contains this GUID.
    #[error("guid {0} already allocated")]
    AlreadyAllocated(String),

    /// Pool does not contain this GUID.
    #[error("guid {0} not allocated")]
    NotAllocated(String),

    /// Malformed GUID, PKey, or annotation payload.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Network-attachment-definition does not carry an ib-sriov plugin entry.
    #[error("not an ib-sriov network: {0}")]
    NotIbSriov(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
