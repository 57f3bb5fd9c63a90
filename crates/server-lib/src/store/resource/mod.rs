//! Agent store persisted as cluster custom resources
//!
//! Each agent is one `Agent` resource named after its identity. Writes go
//! straight to the API server, which resolves write conflicts; the companion
//! [`Reconciler`] acknowledges them asynchronously. A report counts as
//! accepted once its spec is written, whether or not the status reset lands.

mod client;
mod crd;
mod reconciler;

pub use client::{KubeResourceClient, ResourceClient, ResourceEvent};
pub use crd::{register_agent_resource, wait_for_agent_resource, Agent, AgentSpec};
pub use reconciler::Reconciler;

use super::{prepare_report, AgentStore, StalenessPolicy};
use crate::error::{Result, StoreError};
use crate::models::{AgentRecord, AgentStatus, LivenessVerdict};
use crate::observability::AgentMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ResourceStore {
    client: Arc<dyn ResourceClient>,
    metrics: AgentMetrics,
    policy: StalenessPolicy,
}

impl ResourceStore {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        metrics: AgentMetrics,
        policy: StalenessPolicy,
    ) -> Self {
        Self {
            client,
            metrics,
            policy,
        }
    }

    async fn lookup(&self, identity: &str) -> Result<Option<Agent>> {
        match self.client.get(identity).await {
            Ok(agent) => Ok(Some(agent)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AgentStore for ResourceStore {
    fn name(&self) -> &'static str {
        "resource"
    }

    async fn accept(&self, identity: &str, payload: &[u8]) -> Result<AgentRecord> {
        let record = prepare_report(identity, payload)?;
        let mut agent = Agent::from_record(identity, record.clone());

        match self.lookup(identity).await? {
            None => {
                self.client.create(&agent).await?;
                debug!(identity = %identity, "Created agent resource");
            }
            Some(current) => {
                agent.metadata.resource_version = current.metadata.resource_version;
                self.client.replace(&agent).await?;
                debug!(identity = %identity, "Updated agent resource");
            }
        }
        self.metrics.record_report(identity, &record);

        // The report is persisted at this point; the status only tells the
        // reconciler there is something to acknowledge.
        if let Err(e) = self
            .client
            .replace_status(identity, &AgentStatus::created())
            .await
        {
            warn!(identity = %identity, error = %e, "Failed to reset agent resource status");
        }
        Ok(record)
    }

    async fn get(&self, identity: &str) -> Result<AgentRecord> {
        Ok(self.client.get(identity).await?.spec.record)
    }

    async fn list(&self) -> Result<HashMap<String, AgentRecord>> {
        Ok(self
            .client
            .list()
            .await?
            .into_iter()
            .map(|agent| (agent.name_any(), agent.spec.record))
            .collect())
    }

    async fn reconcile_at(
        &self,
        expected: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<LivenessVerdict> {
        let mut records = self.list().await?;

        // Only a NotFound on a direct read makes an identity absent; a
        // resource created after the listing still counts as present.
        for identity in expected {
            if records.contains_key(identity) {
                continue;
            }
            if let Some(agent) = self.lookup(identity).await? {
                records.insert(identity.clone(), agent.spec.record);
            }
        }

        Ok(self.policy.classify(&records, expected, now))
    }

    async fn purge(&self, expected: &HashSet<String>) -> Result<Vec<String>> {
        let stored = self.client.list().await?;
        let mut removed = Vec::new();
        for agent in stored {
            let identity = agent.name_any();
            if expected.contains(&identity) {
                continue;
            }
            self.client.delete(&identity).await?;
            self.metrics.forget(&identity);
            removed.push(identity);
        }
        Ok(removed)
    }
}
