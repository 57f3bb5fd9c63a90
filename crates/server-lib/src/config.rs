//! Storage and membership configuration

use serde::Deserialize;
use std::time::Duration;

/// Storage engine backing the agent cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process-local map, lost on restart
    #[default]
    Volatile,
    /// One cluster custom resource per agent
    Resource,
    /// TTL-keyed report log in etcd
    Tree,
}

/// Storage layer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Lifetime of a tree store report node in seconds
    #[serde(default = "default_report_ttl")]
    pub report_ttl_secs: u64,

    /// Deadline for the tree store startup probe in seconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Deadline applied to every other remote call in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Namespace prefix for tree store keys
    #[serde(default = "default_tree_root")]
    pub tree_root: String,

    #[serde(default)]
    pub etcd_endpoints: Vec<String>,

    /// Namespace holding agent custom resources
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Multiple of the report interval after which a record is outdated
    #[serde(default = "default_stale_factor")]
    pub stale_factor: u32,
}

fn default_report_ttl() -> u64 {
    300
}

fn default_ping_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    10
}

fn default_tree_root() -> String {
    "netchecker".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_stale_factor() -> u32 {
    2
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            report_ttl_secs: default_report_ttl(),
            ping_timeout_secs: default_ping_timeout(),
            request_timeout_secs: default_request_timeout(),
            tree_root: default_tree_root(),
            etcd_endpoints: Vec::new(),
            namespace: default_namespace(),
            stale_factor: default_stale_factor(),
        }
    }
}

impl StorageConfig {
    pub fn report_ttl(&self) -> Duration {
        Duration::from_secs(self.report_ttl_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Where the set of agents expected to report comes from
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    /// Without membership the janitor never purges and nothing is absent
    #[serde(default)]
    pub enabled: bool,

    /// Restrict the pod listing to one namespace (all namespaces if unset)
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_label_key")]
    pub label_key: String,

    #[serde(default = "default_label_values")]
    pub label_values: Vec<String>,
}

fn default_label_key() -> String {
    "app".to_string()
}

fn default_label_values() -> Vec<String> {
    vec![
        "netchecker-agent".to_string(),
        "netchecker-agent-hostnet".to_string(),
    ]
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: None,
            label_key: default_label_key(),
            label_values: default_label_values(),
        }
    }
}

impl MembershipConfig {
    /// Label selector matching agent pods, e.g. `app in (a,b)`
    pub fn label_selector(&self) -> String {
        format!("{} in ({})", self.label_key, self.label_values.join(","))
    }
}
