//! `Agent` custom resource and its one-time registration

use super::client::ResourceClient;
use crate::error::{Result, StoreError};
use crate::models::{AgentRecord, AgentState, AgentStatus};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Interval between visibility checks while waiting for the resource type
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network-checker.ext",
    version = "v1",
    kind = "Agent",
    plural = "agents",
    namespaced,
    status = "AgentStatus"
)]
pub struct AgentSpec {
    #[serde(flatten)]
    pub record: AgentRecord,
}

impl Agent {
    /// Build a resource carrying `record`, status reset to `Created`
    pub fn from_record(identity: &str, record: AgentRecord) -> Self {
        let mut agent = Agent::new(identity, AgentSpec { record });
        agent.status = Some(AgentStatus::created());
        agent
    }

    pub fn is_processed(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.state == AgentState::Processed)
            .unwrap_or(false)
    }
}

/// Register the `agents.network-checker.ext` resource type.
///
/// An existing definition counts as success.
pub async fn register_agent_resource(client: kube::Client, timeout: Duration) -> Result<()> {
    let definitions: Api<CustomResourceDefinition> = Api::all(client);
    let crd = Agent::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    let created = tokio::time::timeout(timeout, definitions.create(&PostParams::default(), &crd))
        .await
        .map_err(|_| StoreError::StartupFailure(format!("registering {name} timed out")))?;

    match created {
        Ok(_) => {
            info!(resource = %name, "Registered agent resource type");
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 409 => {
            debug!(resource = %name, "Agent resource type already registered");
            Ok(())
        }
        Err(e) => Err(StoreError::StartupFailure(format!(
            "registering {name} failed: {e}"
        ))),
    }
}

/// Poll until the resource type answers list calls or `timeout` elapses
pub async fn wait_for_agent_resource(client: &dyn ResourceClient, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match client.list().await {
            Ok(_) => return Ok(()),
            Err(e) if Instant::now() + WAIT_POLL_INTERVAL > deadline => {
                return Err(StoreError::StartupFailure(format!(
                    "agent resource type not visible after {}s: {e}",
                    timeout.as_secs()
                )));
            }
            Err(e) => {
                debug!(error = %e, "Agent resource type not visible yet");
                sleep(WAIT_POLL_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_identity() {
        let crd = Agent::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("agents.network-checker.ext"));
        assert_eq!(crd.spec.group, "network-checker.ext");
        assert_eq!(crd.spec.names.kind, "Agent");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_from_record_resets_status() {
        let agent = Agent::from_record("agent-pod", AgentRecord::default());
        assert_eq!(agent.metadata.name.as_deref(), Some("agent-pod"));
        assert!(!agent.is_processed());
        assert_eq!(agent.status, Some(AgentStatus::created()));
    }
}
