//! Core data models for the netchecker server

use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Result of one HTTP probe executed by an agent.
///
/// Field names follow the agent's wire format, which predates snake_case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct ProbeResult {
    #[serde(rename = "URL")]
    pub url: String,
    pub connection_result: i64,
    #[serde(rename = "HTTPCode")]
    pub http_code: i64,
    pub total: i64,
    pub content_transfer: i64,
    #[serde(rename = "TCPConnection")]
    pub tcp_connection: i64,
    #[serde(rename = "DNSLookup")]
    pub dns_lookup: i64,
    pub connect: i64,
    pub server_processing: i64,
}

/// Keepalive report pushed by a netchecker agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentRecord {
    /// Self-declared heartbeat period in seconds
    pub report_interval: i64,
    #[serde(rename = "nodename", default)]
    pub node_name: String,
    #[serde(rename = "podname", default)]
    pub pod_name: String,
    /// Agent wall clock at report creation (diagnostic only)
    #[serde(rename = "hostdate", default)]
    pub host_date: Option<DateTime<Utc>>,
    /// Assigned by the store on acceptance
    #[serde(default)]
    pub last_updated: DateTime<Utc>,
    /// Agent uptime counter, orders reports in the tree store
    #[serde(default)]
    pub uptime: u64,
    #[serde(rename = "nslookup", default, deserialize_with = "null_as_default")]
    pub lookups: HashMap<String, Vec<String>>,
    #[serde(rename = "network_probes", default, deserialize_with = "null_as_default")]
    pub probes: Vec<ProbeResult>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ips: HashMap<String, Vec<String>>,
}

// Agents encode empty maps and slices as `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl AgentRecord {
    /// Decode and validate a raw report payload.
    ///
    /// Whatever `last_updated` the client sent is discarded; callers stamp
    /// it with [`AgentRecord::stamp`] once the report is accepted.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut record: AgentRecord = serde_json::from_slice(payload)
            .map_err(|e| StoreError::InvalidRecord(format!("malformed payload: {e}")))?;
        record.validate()?;
        record.last_updated = DateTime::<Utc>::default();
        Ok(record)
    }

    pub fn validate(&self) -> Result<()> {
        if self.report_interval <= 0 {
            return Err(StoreError::InvalidRecord(format!(
                "report_interval must be positive, got {}",
                self.report_interval
            )));
        }
        Ok(())
    }

    /// Set the acceptance timestamp
    pub fn stamp(mut self, now: DateTime<Utc>) -> Self {
        self.last_updated = now;
        self
    }

    /// Seconds elapsed since the report was accepted
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_updated).num_milliseconds() as f64 / 1000.0
    }

    /// Label identifying the agent in exported metrics
    pub fn metric_label(&self) -> String {
        let network = if self.pod_name.contains("hostnet") {
            "host_network"
        } else {
            "private_network"
        };
        format!("{}-{}", self.node_name, network)
    }
}

/// Lifecycle of a record persisted as a cluster resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AgentState {
    /// Written, not yet acknowledged by the reconciler
    #[default]
    Created,
    /// Acknowledged by the reconciler
    Processed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AgentStatus {
    #[serde(default)]
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl AgentStatus {
    pub fn created() -> Self {
        Self {
            state: AgentState::Created,
            message: "Created, not processed yet".to_string(),
        }
    }

    pub fn processed() -> Self {
        Self {
            state: AgentState::Processed,
            message: "Successfully processed".to_string(),
        }
    }
}

/// Outcome of evaluating stored reports against the expected agents.
///
/// `absent` and `outdated` never share a member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub absent: BTreeSet<String>,
    pub outdated: BTreeSet<String>,
}

impl LivenessVerdict {
    pub fn is_clean(&self) -> bool {
        self.absent.is_empty() && self.outdated.is_empty()
    }
}
