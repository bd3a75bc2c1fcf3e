//! UFM (Unified Fabric Manager) Subnet Manager driver.
//!
//! Talks to UFM's REST API over HTTPS. `ureq` is synchronous, so every
//! call is dispatched through [`tokio::task::spawn_blocking`]; retries
//! use the same exponential-backoff shape as the rest of the daemon.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{MembershipKind, SmPlugin};
use crate::error::{ControllerError, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddGuidsRequest<'a> {
    guids: &'a [String],
    pkey: String,
    membership: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoveGuidsRequest<'a> {
    guids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct PkeyMembership {
    pkey: String,
    guids: Vec<String>,
}

pub struct UfmPlugin {
    base_url: String,
}

impl UfmPlugin {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        }
    }

    fn list_blocking(base_url: &str) -> Result<HashMap<String, String>> {
        let url = format!("{base_url}/ufmRest/resources/pkeys?guids_data=true");

        let response = backoff::retry(Self::backoff(), || {
            ureq::get(&url).call().map_err(|e| {
                warn!(error = %e, "ufm list_guids_in_use failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .map_err(|e| ControllerError::Sm(format!("ufm list_guids_in_use failed: {e}")))?;

        let memberships: Vec<PkeyMembership> = response
            .into_json()
            .map_err(|e| ControllerError::Sm(format!("ufm list_guids_in_use: bad response body: {e}")))?;

        let mut by_guid = HashMap::new();
        for membership in memberships {
            for guid in membership.guids {
                by_guid.insert(guid, membership.pkey.clone());
            }
        }
        Ok(by_guid)
    }

    fn add_blocking(
        base_url: &str,
        pkey: u16,
        guids: &[String],
        membership: MembershipKind,
    ) -> Result<()> {
        let url = format!("{base_url}/ufmRest/resources/pkeys/{pkey:#06x}");
        let request = AddGuidsRequest {
            guids,
            pkey: format!("{pkey:#06x}"),
            membership: match membership {
                MembershipKind::Full => "full",
                MembershipKind::Limited => "limited",
            },
        };

        backoff::retry(Self::backoff(), || {
            ureq::put(&url).send_json(&request).map_err(|e| {
                warn!(pkey = %pkey, error = %e, "ufm add_guids_to_pkey failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .map(|_| ())
        .map_err(|e| ControllerError::Sm(format!("ufm add_guids_to_pkey({pkey:#06x}) failed: {e}")))
    }

    fn remove_blocking(base_url: &str, pkey: u16, guids: &[String]) -> Result<()> {
        let url = format!("{base_url}/ufmRest/resources/pkeys/{pkey:#06x}/guids");
        let request = RemoveGuidsRequest { guids };

        let result = backoff::retry(Self::backoff(), || {
            ureq::delete(&url).send_json(&request).map_err(|e| {
                if let ureq::Error::Status(404, _) = e {
                    // Partition or GUID already absent: idempotent, not retried.
                    return backoff::Error::permanent(e);
                }
                warn!(pkey = %pkey, error = %e, "ufm remove_guids_from_pkey failed, retrying");
                backoff::Error::transient(e)
            })
        });

        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(other) => Err(ControllerError::Sm(format!(
                "ufm remove_guids_from_pkey({pkey:#06x}) failed: {other}"
            ))),
        }
    }
}

#[async_trait]
impl SmPlugin for UfmPlugin {
    fn name(&self) -> &str {
        "ufm"
    }

    fn spec(&self) -> String {
        format!("UFM REST driver at {}", self.base_url)
    }

    /// Confirms the UFM endpoint is reachable before the daemon starts
    /// relying on it; any failure here is treated as a fatal startup error.
    async fn validate(&self) -> Result<()> {
        self.list_guids_in_use().await.map(|_| ())
    }

    async fn list_guids_in_use(&self) -> Result<HashMap<String, String>> {
        let base_url = self.base_url.clone();
        tokio::task::spawn_blocking(move || Self::list_blocking(&base_url))
            .await
            .map_err(|e| ControllerError::Sm(format!("ufm task panicked: {e}")))?
    }

    async fn add_guids_to_pkey(
        &self,
        pkey: u16,
        guids: &[String],
        membership: MembershipKind,
    ) -> Result<()> {
        let base_url = self.base_url.clone();
        let guids = guids.to_vec();
        tokio::task::spawn_blocking(move || Self::add_blocking(&base_url, pkey, &guids, membership))
            .await
            .map_err(|e| ControllerError::Sm(format!("ufm task panicked: {e}")))?
    }

    async fn remove_guids_from_pkey(&self, pkey: u16, guids: &[String]) -> Result<()> {
        let base_url = self.base_url.clone();
        let guids = guids.to_vec();
        tokio::task::spawn_blocking(move || Self::remove_blocking(&base_url, pkey, &guids))
            .await
            .map_err(|e| ControllerError::Sm(format!("ufm task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_slash_from_base_url() {
        let plugin = UfmPlugin::new("https://ufm.example.com/".to_string());
        assert_eq!(plugin.base_url, "https://ufm.example.com");
    }
}
