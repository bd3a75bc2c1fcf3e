//! Subnet Manager driver plugins (spec.md §4.7, §6).
//!
//! The reference implementation loads SM drivers as shared objects at
//! runtime. We use a compile-time registry instead: a small, closed set
//! of drivers known at build time, selected by name from [`Config`].

pub mod noop;
pub mod ufm;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{ControllerError, Result};

/// PKey membership requested for a GUID joining a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipKind {
    Full,
    Limited,
}

/// The operations a Subnet Manager driver must support.
#[async_trait]
pub trait SmPlugin: Send + Sync {
    /// Driver name, for logging.
    fn name(&self) -> &str;

    /// Informational driver description (e.g. endpoint, version).
    fn spec(&self) -> String;

    /// Called once after load; a failure here aborts startup.
    async fn validate(&self) -> Result<()>;

    /// All GUIDs the SM currently reports as partition members, keyed
    /// by GUID string with the owning pkey string as value. Used by
    /// startup pool recovery to reconcile local state against the SM.
    async fn list_guids_in_use(&self) -> Result<HashMap<String, String>>;

    /// Adds `guids` as members of the partition identified by `pkey`.
    async fn add_guids_to_pkey(
        &self,
        pkey: u16,
        guids: &[String],
        membership: MembershipKind,
    ) -> Result<()>;

    /// Removes `guids` from the partition identified by `pkey`. Must be
    /// idempotent: removing an unknown GUID is not an error.
    async fn remove_guids_from_pkey(&self, pkey: u16, guids: &[String]) -> Result<()>;
}

/// Resolves [`Config::sm_plugin`] to a compiled-in driver.
pub fn load(config: &Config) -> Result<Arc<dyn SmPlugin>> {
    match config.sm_plugin.as_str() {
        "noop" => Ok(Arc::new(noop::NoopPlugin::new())),
        "ufm" => {
            let base_url = config.sm_plugin_path.clone().ok_or_else(|| {
                ControllerError::Config("ufm plugin requires DAEMON_SM_PLUGIN_PATH".to_string())
            })?;
            Ok(Arc::new(ufm::UfmPlugin::new(base_url)))
        }
        other => Err(ControllerError::Config(format!("unknown sm_plugin: {other}"))),
    }
}
