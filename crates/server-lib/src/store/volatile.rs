//! Process-local agent store
//!
//! One map behind one lock. Nothing survives a restart; agents re-report
//! within one interval.

use super::{prepare_report, AgentStore, StalenessPolicy};
use crate::error::{Result, StoreError};
use crate::models::{AgentRecord, LivenessVerdict};
use crate::observability::AgentMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

pub struct VolatileStore {
    agents: Mutex<HashMap<String, AgentRecord>>,
    metrics: AgentMetrics,
    policy: StalenessPolicy,
}

impl VolatileStore {
    pub fn new(metrics: AgentMetrics, policy: StalenessPolicy) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            metrics,
            policy,
        }
    }

    pub async fn len(&self) -> usize {
        self.agents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.lock().await.is_empty()
    }
}

#[async_trait]
impl AgentStore for VolatileStore {
    fn name(&self) -> &'static str {
        "volatile"
    }

    async fn accept(&self, identity: &str, payload: &[u8]) -> Result<AgentRecord> {
        let mut record = prepare_report(identity, payload)?;

        {
            let mut agents = self.agents.lock().await;
            if let Some(previous) = agents.get(identity) {
                // Keep acceptance times strictly increasing per identity
                if record.last_updated <= previous.last_updated {
                    record.last_updated = previous.last_updated + Duration::microseconds(1);
                }
            }
            agents.insert(identity.to_string(), record.clone());
        }

        self.metrics.record_report(identity, &record);
        debug!(identity = %identity, "Stored agent report");
        Ok(record)
    }

    async fn get(&self, identity: &str) -> Result<AgentRecord> {
        self.agents
            .lock()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))
    }

    async fn list(&self) -> Result<HashMap<String, AgentRecord>> {
        Ok(self.agents.lock().await.clone())
    }

    async fn reconcile_at(
        &self,
        expected: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<LivenessVerdict> {
        let agents = self.agents.lock().await;
        Ok(self.policy.classify(&agents, expected, now))
    }

    async fn purge(&self, expected: &HashSet<String>) -> Result<Vec<String>> {
        let removed: Vec<String> = {
            let mut agents = self.agents.lock().await;
            let removed: Vec<String> = agents
                .keys()
                .filter(|identity| !expected.contains(*identity))
                .cloned()
                .collect();
            for identity in &removed {
                agents.remove(identity);
            }
            removed
        };

        for identity in &removed {
            self.metrics.forget(identity);
        }
        if !removed.is_empty() {
            debug!(removed = ?removed, "Purged agents no longer expected");
        }
        Ok(removed)
    }
}
