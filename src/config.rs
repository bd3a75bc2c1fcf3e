//! Daemon configuration (spec.md §4.8).
//!
//! Configuration is environment-variable only: there is no config file
//! and no control-plane round trip at startup. Everything the
//! reconciler needs is resolvable before the watcher starts.

use crate::error::{ControllerError, Result};

const DEFAULT_PERIODIC_UPDATE_SECS: u64 = 5;
const DEFAULT_GUID_POOL_RANGE_START: &str = "02:00:00:00:00:00:00:00";
const DEFAULT_GUID_POOL_RANGE_END: &str = "02:FF:FF:FF:FF:FF:FF:FF";
const DEFAULT_SM_PLUGIN_PATH: &str = "/plugins";

/// Daemon-level configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between reconciler ticks.
    pub periodic_update: u64,

    /// Name of the compiled-in Subnet Manager plugin to use (e.g. `"noop"`, `"ufm"`).
    pub sm_plugin: String,

    /// Plugin-specific connection info (e.g. the UFM base URL). Defaults
    /// to `/plugins` when unset (spec.md §6).
    pub sm_plugin_path: Option<String>,

    /// Inclusive start of the GUID pool range.
    pub guid_pool_range_start: String,

    /// Inclusive end of the GUID pool range.
    pub guid_pool_range_end: String,

    /// Write allocated GUIDs into `infiniband-guid-request` instead of `cni-args.guid`.
    pub write_guid_as_runtime_config: bool,

    /// Whether IP-over-IB is enabled cluster-wide; selects full vs. limited
    /// PKey membership when none is specified per-attachment.
    pub enable_ip_over_ib: bool,

    /// Default PKey membership when `enable_ip_over_ib` leaves it ambiguous.
    pub default_limited_partition: bool,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn load() -> Result<Self> {
        let sm_plugin = std::env::var("DAEMON_SM_PLUGIN")
            .map_err(|_| ControllerError::Config("DAEMON_SM_PLUGIN must be set".to_string()))?;

        let guid_pool_range_start = std::env::var("GUID_POOL_RANGE_START")
            .unwrap_or_else(|_| DEFAULT_GUID_POOL_RANGE_START.to_string());
        let guid_pool_range_end = std::env::var("GUID_POOL_RANGE_END")
            .unwrap_or_else(|_| DEFAULT_GUID_POOL_RANGE_END.to_string());

        let periodic_update = std::env::var("DAEMON_PERIODIC_UPDATE")
            .ok()
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|_| ControllerError::Config(format!("invalid DAEMON_PERIODIC_UPDATE: {s}")))
            })
            .transpose()?
            .unwrap_or(DEFAULT_PERIODIC_UPDATE_SECS);

        let config = Config {
            periodic_update,
            sm_plugin,
            sm_plugin_path: Some(
                std::env::var("DAEMON_SM_PLUGIN_PATH").unwrap_or_else(|_| DEFAULT_SM_PLUGIN_PATH.to_string()),
            ),
            guid_pool_range_start,
            guid_pool_range_end,
            write_guid_as_runtime_config: env_bool("DAEMON_GUID_AS_RUNTIME_CONFIG", true)?,
            enable_ip_over_ib: env_bool("DAEMON_ENABLE_IP_OVER_IB", false)?,
            default_limited_partition: env_bool("DAEMON_DEFAULT_LIMITED_PARTITION", true)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sm_plugin.is_empty() {
            return Err(ControllerError::Config("sm_plugin cannot be empty".to_string()));
        }
        if self.periodic_update == 0 {
            return Err(ControllerError::Config(
                "periodic_update must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(s) => match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ControllerError::Config(format!("invalid boolean for {key}: {s}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "DAEMON_SM_PLUGIN",
            "DAEMON_SM_PLUGIN_PATH",
            "GUID_POOL_RANGE_START",
            "GUID_POOL_RANGE_END",
            "DAEMON_PERIODIC_UPDATE",
            "DAEMON_GUID_AS_RUNTIME_CONFIG",
            "DAEMON_ENABLE_IP_OVER_IB",
            "DAEMON_DEFAULT_LIMITED_PARTITION",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn requires_sm_plugin() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("GUID_POOL_RANGE_START", "02:00:00:00:00:00:00:01");
        std::env::set_var("GUID_POOL_RANGE_END", "02:00:00:00:00:00:00:ff");
        let result = Config::load();
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn applies_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("DAEMON_SM_PLUGIN", "noop");
        std::env::set_var("GUID_POOL_RANGE_START", "02:00:00:00:00:00:00:01");
        std::env::set_var("GUID_POOL_RANGE_END", "02:00:00:00:00:00:00:ff");
        let config = Config::load().unwrap();
        assert_eq!(config.periodic_update, DEFAULT_PERIODIC_UPDATE_SECS);
        assert!(config.write_guid_as_runtime_config);
        assert!(!config.enable_ip_over_ib);
        assert!(config.default_limited_partition);
        clear_env();
    }

    #[test]
    fn applies_documented_defaults_for_range_and_plugin_path() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("DAEMON_SM_PLUGIN", "noop");
        let config = Config::load().unwrap();
        assert_eq!(config.guid_pool_range_start, DEFAULT_GUID_POOL_RANGE_START);
        assert_eq!(config.guid_pool_range_end, DEFAULT_GUID_POOL_RANGE_END);
        assert_eq!(config.sm_plugin_path.as_deref(), Some(DEFAULT_SM_PLUGIN_PATH));
        clear_env();
    }

    #[test]
    fn rejects_zero_periodic_update() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("DAEMON_SM_PLUGIN", "noop");
        std::env::set_var("GUID_POOL_RANGE_START", "02:00:00:00:00:00:00:01");
        std::env::set_var("GUID_POOL_RANGE_END", "02:00:00:00:00:00:00:ff");
        std::env::set_var("DAEMON_PERIODIC_UPDATE", "0");
        let result = Config::load();
        assert!(result.is_err());
        clear_env();
    }
}

