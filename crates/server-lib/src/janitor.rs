//! Cache eviction and the periodic staleness sweep
//!
//! The janitor drops cached agents that are no longer expected to report.
//! It runs opportunistically before reads and on every sweep tick.

use crate::error::Result;
use crate::membership::MembershipSource;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::store::AgentStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct CacheJanitor {
    store: Arc<dyn AgentStore>,
    membership: Option<Arc<dyn MembershipSource>>,
    logger: StructuredLogger,
}

impl CacheJanitor {
    /// Without a membership source purging is a no-op
    pub fn new(
        store: Arc<dyn AgentStore>,
        membership: Option<Arc<dyn MembershipSource>>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            membership,
            logger,
        }
    }

    /// Current membership snapshot, `None` without a membership source.
    ///
    /// Membership failures are returned, never treated as "nobody expected".
    pub async fn expected(&self) -> Result<Option<HashSet<String>>> {
        match &self.membership {
            Some(membership) => Ok(Some(membership.list_expected().await?)),
            None => Ok(None),
        }
    }

    /// Remove stored agents missing from the current membership snapshot
    pub async fn purge(&self) -> Result<Vec<String>> {
        match self.expected().await? {
            Some(expected) => self.purge_with(&expected).await,
            None => Ok(Vec::new()),
        }
    }

    /// Remove stored agents missing from an already fetched snapshot
    pub async fn purge_with(&self, expected: &HashSet<String>) -> Result<Vec<String>> {
        let removed = self.store.purge(expected).await?;
        self.logger.log_purge(&removed);
        Ok(removed)
    }
}

/// Configuration for the background sweep
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Fixed tick interval (default: 5 seconds)
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Background task purging the cache and counting keepalive misses
pub struct SweepLoop {
    janitor: Arc<CacheJanitor>,
    store: Arc<dyn AgentStore>,
    metrics: AgentMetrics,
    config: SweepConfig,
}

impl SweepLoop {
    pub fn new(
        janitor: Arc<CacheJanitor>,
        store: Arc<dyn AgentStore>,
        metrics: AgentMetrics,
        config: SweepConfig,
    ) -> Self {
        Self {
            janitor,
            store,
            metrics,
            config,
        }
    }

    /// Tick until `shutdown` fires. Failures are logged; the next tick retries.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            backend = self.store.name(),
            "Starting staleness sweep loop"
        );

        let mut ticker = interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "Staleness sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutting down staleness sweep loop");
                    break;
                }
            }
        }
    }

    /// One purge plus one pass of keepalive-miss accounting.
    ///
    /// Handles of identities whose records are gone (expired tree nodes) are
    /// dropped. Only identities tracked before the listing are considered, so
    /// a report accepted mid-sweep keeps its handles.
    pub async fn sweep_once(&self) -> Result<usize> {
        if let Err(e) = self.janitor.purge().await {
            warn!(error = %e, "Cache purge failed during sweep");
        }
        let tracked = self.metrics.tracked_identities();
        let records = self.store.list().await?;
        for identity in tracked.iter().filter(|id| !records.contains_key(*id)) {
            debug!(identity = %identity, "Dropping metrics of expired agent");
            self.metrics.forget(identity);
        }
        let moved = self.metrics.sweep(&records, Utc::now());
        if moved > 0 {
            debug!(agents = moved, "Counted keepalive misses");
        }
        Ok(moved)
    }
}
