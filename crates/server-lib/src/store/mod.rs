//! Agent liveness cache
//!
//! This module provides:
//! - The `AgentStore` capability every storage backend implements
//! - The staleness policy shared by all backends
//! - A process-local backend, a custom-resource backend and an etcd tree backend

mod resource;
mod tree;
mod volatile;


pub use resource::{
    register_agent_resource, wait_for_agent_resource, Agent, AgentSpec, KubeResourceClient,
    Reconciler, ResourceClient, ResourceEvent, ResourceStore,
};
pub use tree::{EtcdTreeClient, TreeClient, TreeNode, TreeStore};
pub use volatile::VolatileStore;

use crate::config::{Backend, StorageConfig};
use crate::error::{Result, StoreError};
use crate::models::{AgentRecord, LivenessVerdict};
use crate::observability::AgentMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Storage for the latest report of every agent
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Backend name used in logs
    fn name(&self) -> &'static str;

    /// Validate a raw report, stamp it with the acceptance time and persist it
    async fn accept(&self, identity: &str, payload: &[u8]) -> Result<AgentRecord>;

    /// Latest record of one identity
    async fn get(&self, identity: &str) -> Result<AgentRecord>;

    /// Latest record of every stored identity
    async fn list(&self) -> Result<HashMap<String, AgentRecord>>;

    /// Classify stored and expected identities as of `now`
    async fn reconcile_at(
        &self,
        expected: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<LivenessVerdict>;

    async fn reconcile(&self, expected: &HashSet<String>) -> Result<LivenessVerdict> {
        self.reconcile_at(expected, Utc::now()).await
    }

    /// Remove every stored identity not in `expected`, returning the removed ones
    async fn purge(&self, expected: &HashSet<String>) -> Result<Vec<String>>;
}

/// Decides when a stored record stops counting as live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    factor: u32,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self { factor: 2 }
    }
}

impl StalenessPolicy {
    /// A factor of zero is bumped to one
    pub fn new(factor: u32) -> Self {
        Self {
            factor: factor.max(1),
        }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    pub fn threshold_secs(&self, record: &AgentRecord) -> f64 {
        record.report_interval as f64 * self.factor as f64
    }

    pub fn is_outdated(&self, record: &AgentRecord, now: DateTime<Utc>) -> bool {
        record.age_secs(now) > self.threshold_secs(record)
    }

    /// Expected identities without a record are absent; stored records past
    /// the threshold are outdated whether or not they are expected.
    pub fn classify(
        &self,
        records: &HashMap<String, AgentRecord>,
        expected: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> LivenessVerdict {
        let absent = expected
            .iter()
            .filter(|identity| !records.contains_key(*identity))
            .cloned()
            .collect();
        let outdated = records
            .iter()
            .filter(|(_, record)| self.is_outdated(record, now))
            .map(|(identity, _)| identity.clone())
            .collect();

        LivenessVerdict { absent, outdated }
    }
}

/// Decode a report and stamp its acceptance time
pub(crate) fn prepare_report(identity: &str, payload: &[u8]) -> Result<AgentRecord> {
    if identity.is_empty() {
        return Err(StoreError::InvalidRecord("empty agent identity".to_string()));
    }
    Ok(AgentRecord::from_payload(payload)?.stamp(Utc::now()))
}

/// A store ready to serve, plus any background task it depends on
pub struct OpenedStore {
    pub store: Arc<dyn AgentStore>,
    pub reconciler: Option<JoinHandle<()>>,
}


/// Run one startup step, giving up as soon as `shutdown` fires
async fn unless_cancelled<T, F>(shutdown: &CancellationToken, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        res = step => res,
        _ = shutdown.cancelled() => Err(StoreError::StartupFailure("cancelled".to_string())),
    }
}

/// Build the configured backend and run its startup sequence.
///
/// Every failure here is a `StartupFailure`. Cancelling `shutdown` aborts
/// in-flight waits and stops the reconciler.
pub async fn open_store(
    config: &StorageConfig,
    metrics: AgentMetrics,
    shutdown: CancellationToken,
) -> Result<OpenedStore> {
    let policy = StalenessPolicy::new(config.stale_factor);
    info!(backend = ?config.backend, stale_factor = policy.factor(), "Opening agent store");

    match config.backend {
        Backend::Volatile => Ok(OpenedStore {
            store: Arc::new(VolatileStore::new(metrics, policy)),
            reconciler: None,
        }),
        Backend::Resource => {
            let client = unless_cancelled(&shutdown, async {
                kube::Client::try_default()
                    .await
                    .map_err(|e| StoreError::StartupFailure(format!("cluster client: {e}")))
            })
            .await?;
            unless_cancelled(
                &shutdown,
                register_agent_resource(client.clone(), config.request_timeout()),
            )
            .await?;
            let resources = Arc::new(KubeResourceClient::new(
                client,
                &config.namespace,
                config.request_timeout(),
            ));
            start_resource_store(resources, metrics, policy, config.request_timeout(), shutdown)
                .await
        }
        Backend::Tree => {
            let client = unless_cancelled(
                &shutdown,
                EtcdTreeClient::connect(&config.etcd_endpoints, config.request_timeout()),
            )
            .await?;
            start_tree_store(Arc::new(client), config, metrics, policy, &shutdown).await
        }
    }
}

/// Wait until the `Agent` resource type is served, then start the reconciler
pub async fn start_resource_store(
    resources: Arc<dyn ResourceClient>,
    metrics: AgentMetrics,
    policy: StalenessPolicy,
    ready_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<OpenedStore> {
    unless_cancelled(
        &shutdown,
        wait_for_agent_resource(resources.as_ref(), ready_timeout),
    )
    .await?;

    let reconciler = Reconciler::new(resources.clone());
    let handle = tokio::spawn(reconciler.run(shutdown));
    Ok(OpenedStore {
        store: Arc::new(ResourceStore::new(resources, metrics, policy)),
        reconciler: Some(handle),
    })
}

/// Ping the tree store before handing it out
pub async fn start_tree_store(
    client: Arc<dyn TreeClient>,
    config: &StorageConfig,
    metrics: AgentMetrics,
    policy: StalenessPolicy,
    shutdown: &CancellationToken,
) -> Result<OpenedStore> {
    let store = TreeStore::new(
        client,
        &config.tree_root,
        config.report_ttl(),
        metrics,
        policy,
    );
    unless_cancelled(shutdown, store.ping(config.ping_timeout())).await?;
    Ok(OpenedStore {
        store: Arc::new(store),
        reconciler: None,
    })
}
