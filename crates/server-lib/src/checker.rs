//! Connectivity check over the whole agent fleet

use crate::error::Result;
use crate::janitor::CacheJanitor;
use crate::models::LivenessVerdict;
use crate::observability::StructuredLogger;
use crate::store::AgentStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Payload answered to a connectivity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub absent: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outdated: Vec<String>,
}

impl ConnectivityReport {
    pub fn is_clean(&self) -> bool {
        self.absent.is_empty() && self.outdated.is_empty()
    }

    fn from_verdict(verdict: LivenessVerdict, reporting: usize) -> Self {
        let message = if verdict.is_clean() {
            format!("All {reporting} pods successfully reported back to the server")
        } else {
            "Connectivity check fails. Reason: there are absent or outdated pods; look up the payload"
                .to_string()
        };
        Self {
            message,
            absent: verdict.absent.into_iter().collect(),
            outdated: verdict.outdated.into_iter().collect(),
        }
    }
}

pub struct ConnectivityChecker {
    store: Arc<dyn AgentStore>,
    janitor: Arc<CacheJanitor>,
    logger: StructuredLogger,
}

impl ConnectivityChecker {
    pub fn new(
        store: Arc<dyn AgentStore>,
        janitor: Arc<CacheJanitor>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            janitor,
            logger,
        }
    }

    /// Purge, snapshot membership, then reconcile the store against it
    pub async fn check(&self) -> Result<ConnectivityReport> {
        let expected = match self.janitor.expected().await? {
            Some(expected) => {
                self.janitor.purge_with(&expected).await?;
                expected
            }
            None => Default::default(),
        };
        let verdict = self.store.reconcile(&expected).await?;
        self.logger.log_connectivity_check(&verdict);

        let reporting = if expected.is_empty() {
            self.store.list().await?.len()
        } else {
            expected.len()
        };
        Ok(ConnectivityReport::from_verdict(verdict, reporting))
    }
}
