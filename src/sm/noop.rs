//! In-memory Subnet Manager driver, used in tests and as a template for
//! development clusters without a real SM.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{MembershipKind, SmPlugin};
use crate::error::Result;

#[derive(Default)]
pub struct NoopPlugin {
    // guid -> pkey
    members: Mutex<HashMap<String, u16>>,
}

impl NoopPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn pkey_of(&self, guid: &str) -> Option<u16> {
        self.members.lock().unwrap().get(guid).copied()
    }
}

#[async_trait]
impl SmPlugin for NoopPlugin {
    fn name(&self) -> &str {
        "noop"
    }

    fn spec(&self) -> String {
        "in-memory subnet manager stub, for local bring-up and tests".to_string()
    }

    async fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn list_guids_in_use(&self) -> Result<HashMap<String, String>> {
        Ok(self
            .members
            .lock()
            .unwrap()
            .iter()
            .map(|(guid, pkey)| (guid.clone(), format!("{pkey:#06x}")))
            .collect())
    }

    async fn add_guids_to_pkey(
        &self,
        pkey: u16,
        guids: &[String],
        _membership: MembershipKind,
    ) -> Result<()> {
        let mut members = self.members.lock().unwrap();
        for guid in guids {
            members.insert(guid.clone(), pkey);
        }
        Ok(())
    }

    async fn remove_guids_from_pkey(&self, _pkey: u16, guids: &[String]) -> Result<()> {
        let mut members = self.members.lock().unwrap();
        for guid in guids {
            members.remove(guid);
        }
        Ok(())
    }
}
