//! Sources of the agent identities expected to report

use crate::config::MembershipConfig;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Supplies the set of identities that should be reporting right now
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// List expected identities; fails with `MembershipUnavailable`
    async fn list_expected(&self) -> Result<HashSet<String>>;
}

/// Agent pods selected by label from the cluster API
pub struct KubeMembership {
    pods: Api<Pod>,
    selector: String,
    timeout: Duration,
}

impl KubeMembership {
    pub fn new(client: kube::Client, config: &MembershipConfig, timeout: Duration) -> Self {
        let pods = match &config.namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        Self {
            pods,
            selector: config.label_selector(),
            timeout,
        }
    }
}

#[async_trait]
impl MembershipSource for KubeMembership {
    async fn list_expected(&self) -> Result<HashSet<String>> {
        debug!(selector = %self.selector, "Listing agent pods");
        let params = ListParams::default().labels(&self.selector);
        let pods = tokio::time::timeout(self.timeout, self.pods.list(&params))
            .await
            .map_err(|_| StoreError::MembershipUnavailable("pod listing timed out".to_string()))?
            .map_err(|e| StoreError::MembershipUnavailable(e.to_string()))?;

        Ok(pods.items.iter().map(|pod| pod.name_any()).collect())
    }
}

/// Build the configured membership source, `None` when membership is disabled
pub async fn open_membership(
    config: &MembershipConfig,
    timeout: Duration,
) -> Result<Option<Arc<dyn MembershipSource>>> {
    if !config.enabled {
        info!("Membership disabled, cache eviction is off");
        return Ok(None);
    }
    let client = kube::Client::try_default()
        .await
        .map_err(|e| StoreError::StartupFailure(format!("cluster client: {e}")))?;
    info!(selector = %config.label_selector(), "Watching agent pods for membership");
    Ok(Some(Arc::new(KubeMembership::new(client, config, timeout))))
}

/// Fixed set of expected identities
#[derive(Default)]
pub struct StaticMembership {
    expected: RwLock<HashSet<String>>,
}

impl StaticMembership {
    pub fn new<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected: RwLock::new(identities.into_iter().map(Into::into).collect()),
        }
    }

    /// Swap in a new expected set
    pub async fn replace<I, S>(&self, identities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.expected.write().await = identities.into_iter().map(Into::into).collect();
    }
}

#[async_trait]
impl MembershipSource for StaticMembership {
    async fn list_expected(&self) -> Result<HashSet<String>> {
        Ok(self.expected.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_membership_replace() {
        let membership = StaticMembership::new(["agent-pod"]);
        assert!(membership.list_expected().await.unwrap().contains("agent-pod"));

        membership.replace(["agent-pod-hostnet"]).await;
        let expected = membership.list_expected().await.unwrap();
        assert_eq!(expected.len(), 1);
        assert!(expected.contains("agent-pod-hostnet"));
    }
}
