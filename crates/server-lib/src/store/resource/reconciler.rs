//! Acknowledges freshly written `Agent` resources
//!
//! Subscribes to the resource change feed and flips every `Created` status to
//! `Processed`. Readers may observe `Created` in between; staleness never
//! depends on the status.

use super::client::{ResourceClient, ResourceEvent};
use super::crd::Agent;
use crate::error::Result;
use crate::models::AgentStatus;
use futures::StreamExt;
use kube::ResourceExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Reconciler {
    client: Arc<dyn ResourceClient>,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client }
    }

    /// Consume the change feed until `shutdown` fires or the feed ends
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting agent resource reconciler");
        let mut events = self.client.events();

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(ResourceEvent::Applied(agent))) => {
                        if let Err(e) = self.on_applied(&agent).await {
                            warn!(
                                agent = %agent.name_any(),
                                error = %e,
                                "Failed to acknowledge agent resource"
                            );
                        }
                    }
                    Some(Ok(ResourceEvent::Deleted(name))) => {
                        debug!(agent = %name, "Agent resource deleted");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Agent resource watch error");
                    }
                    None => {
                        warn!("Agent resource watch ended");
                        break;
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("Shutting down agent resource reconciler");
                    break;
                }
            }
        }
    }

    /// Mark one resource processed. Returns false when nothing had to change.
    pub async fn on_applied(&self, agent: &Agent) -> Result<bool> {
        if agent.is_processed() {
            return Ok(false);
        }
        let name = agent.name_any();
        self.client
            .replace_status(&name, &AgentStatus::processed())
            .await?;
        debug!(agent = %name, "Agent resource processed");
        Ok(true)
    }
}
