//! Server configuration

use anyhow::Result;
use serde::Deserialize;
use server_lib::{MembershipConfig, StorageConfig, SweepConfig};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP API binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Staleness sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub membership: MembershipConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_sweep_interval() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            sweep_interval_secs: default_sweep_interval(),
            storage: StorageConfig::default(),
            membership: MembershipConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `NETCHECKER_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `NETCHECKER_STORAGE__BACKEND=tree`.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("NETCHECKER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("storage.etcd_endpoints")
                    .with_list_parse_key("membership.label_values")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn sweep(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use server_lib::Backend;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8081");
        assert_eq!(config.sweep().interval, Duration::from_secs(5));
        assert_eq!(config.storage.backend, Backend::Volatile);
        assert!(!config.membership.enabled);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: ServerConfig = serde_json::from_value(serde_json::json!({
            "storage": {"backend": "tree", "etcd_endpoints": ["http://etcd:2379"]}
        }))
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8081");
        assert_eq!(config.storage.backend, Backend::Tree);
        assert_eq!(config.storage.report_ttl_secs, 300);
        assert_eq!(config.storage.etcd_endpoints, vec!["http://etcd:2379"]);
    }

    #[test]
    fn test_zero_sweep_interval_clamped() {
        let config = ServerConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.sweep().interval, Duration::from_secs(1));
    }
}
