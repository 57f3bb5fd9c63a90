//! Agent store kept as a self-expiring report log in etcd
//!
//! Layout: `<root>/agents/<identity>` is a directory marker and every report
//! is an immutable leaf `<root>/agents/<identity>/<uptime>`. Both carry the
//! report TTL, so identities that stop reporting disappear on their own.
//! The current record of an identity is its leaf with the highest uptime.

mod client;

pub use client::{EtcdTreeClient, TreeClient, TreeNode};

use super::{prepare_report, AgentStore, StalenessPolicy};
use crate::error::{Result, StoreError};
use crate::models::{AgentRecord, LivenessVerdict};
use crate::observability::AgentMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DIR_MARKER: &[u8] = b"";

pub struct TreeStore {
    client: Arc<dyn TreeClient>,
    root: String,
    report_ttl: Duration,
    metrics: AgentMetrics,
    policy: StalenessPolicy,
}

impl TreeStore {
    pub fn new(
        client: Arc<dyn TreeClient>,
        root: &str,
        report_ttl: Duration,
        metrics: AgentMetrics,
        policy: StalenessPolicy,
    ) -> Self {
        Self {
            client,
            root: root.trim_end_matches('/').to_string(),
            report_ttl,
            metrics,
            policy,
        }
    }

    fn agents_prefix(&self) -> String {
        format!("{}/agents/", self.root)
    }

    fn agent_dir(&self, identity: &str) -> String {
        format!("{}/agents/{}", self.root, identity)
    }

    fn report_key(&self, identity: &str, uptime: u64) -> String {
        format!("{}/{}", self.agent_dir(identity), uptime)
    }

    /// Write and read back a sentinel key within `timeout`.
    ///
    /// The store is unusable without connectivity, so any failure is fatal.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let key = format!("{}/ping", self.root);
        let probe = async {
            self.client.put(&key, b"pong".to_vec(), None).await?;
            self.client.get(&key).await
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(Some(value))) if value == b"pong" => {
                info!(key = %key, "Tree store answered ping");
                Ok(())
            }
            Ok(Ok(_)) => Err(StoreError::StartupFailure(format!(
                "ping key {key} did not read back"
            ))),
            Ok(Err(e)) => Err(StoreError::StartupFailure(format!("ping failed: {e}"))),
            Err(_) => Err(StoreError::StartupFailure(format!(
                "ping has no answer after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Create the identity directory or refresh its TTL
    async fn ensure_dir(&self, identity: &str) -> Result<()> {
        let dir = self.agent_dir(identity);
        if self.client.get(&dir).await?.is_none()
            && self.client.create(&dir, DIR_MARKER.to_vec(), self.report_ttl).await?
        {
            debug!(dir = %dir, "Created agent directory");
            return Ok(());
        }
        self.client
            .put(&dir, DIR_MARKER.to_vec(), Some(self.report_ttl))
            .await?;
        debug!(dir = %dir, "Refreshed agent directory TTL");
        Ok(())
    }

    /// Reduce scanned leaves to the latest record per identity
    fn reduce(&self, nodes: Vec<TreeNode>) -> HashMap<String, AgentRecord> {
        let prefix = self.agents_prefix();
        let mut latest: HashMap<String, AgentRecord> = HashMap::new();

        for node in nodes {
            let Some(rest) = node.key.strip_prefix(&prefix) else {
                continue;
            };
            // Directory markers have no leaf component
            let Some((identity, _)) = rest.split_once('/') else {
                continue;
            };
            let record: AgentRecord = match serde_json::from_slice(&node.value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %node.key, error = %e, "Skipping undecodable report node");
                    continue;
                }
            };
            if record.uptime == 0 {
                continue;
            }
            match latest.get(identity) {
                Some(current) if current.uptime >= record.uptime => {}
                _ => {
                    latest.insert(identity.to_string(), record);
                }
            }
        }

        latest
    }
}

#[async_trait]
impl AgentStore for TreeStore {
    fn name(&self) -> &'static str {
        "tree"
    }

    async fn accept(&self, identity: &str, payload: &[u8]) -> Result<AgentRecord> {
        let record = prepare_report(identity, payload)?;
        if record.uptime == 0 {
            return Err(StoreError::InvalidRecord(
                "uptime must be positive to order reports".to_string(),
            ));
        }

        self.ensure_dir(identity).await?;

        let key = self.report_key(identity, record.uptime);
        let value = serde_json::to_vec(&record)?;
        if !self.client.create(&key, value, self.report_ttl).await? {
            return Err(StoreError::InvalidRecord(format!(
                "duplicate report ordinal {} for {identity}",
                record.uptime
            )));
        }
        debug!(key = %key, "Created report node");

        self.metrics.record_report(identity, &record);
        Ok(record)
    }

    async fn get(&self, identity: &str) -> Result<AgentRecord> {
        let nodes = self
            .client
            .scan(&format!("{}/", self.agent_dir(identity)))
            .await?;
        self.reduce(nodes)
            .remove(identity)
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))
    }

    async fn list(&self) -> Result<HashMap<String, AgentRecord>> {
        let nodes = self.client.scan(&self.agents_prefix()).await?;
        Ok(self.reduce(nodes))
    }

    async fn reconcile_at(
        &self,
        expected: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<LivenessVerdict> {
        let records = self.list().await?;
        Ok(self.policy.classify(&records, expected, now))
    }

    async fn purge(&self, _expected: &HashSet<String>) -> Result<Vec<String>> {
        // Expired nodes are removed by the store's own TTL
        Ok(Vec::new())
    }
}
