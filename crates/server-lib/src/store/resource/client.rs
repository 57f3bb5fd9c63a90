//! Access to `Agent` resources on the cluster API

use super::crd::Agent;
use crate::error::{Result, StoreError};
use crate::models::AgentStatus;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use serde_json::json;
use std::future::Future;
use std::time::Duration;

/// Change notification for `Agent` resources
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    /// Created or updated
    Applied(Agent),
    Deleted(String),
}

/// Resource operations the store and reconciler rely on
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fails with `NotFound` when no resource has that name
    async fn get(&self, name: &str) -> Result<Agent>;

    async fn create(&self, agent: &Agent) -> Result<Agent>;

    /// Overwrite an existing resource; `resourceVersion` guards the write when set
    async fn replace(&self, agent: &Agent) -> Result<Agent>;

    async fn replace_status(&self, name: &str, status: &AgentStatus) -> Result<Agent>;

    async fn list(&self) -> Result<Vec<Agent>>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Change feed over all `Agent` resources
    fn events(&self) -> BoxStream<'static, Result<ResourceEvent>>;
}

/// `ResourceClient` backed by the cluster API server
pub struct KubeResourceClient {
    api: Api<Agent>,
    timeout: Duration,
}

impl KubeResourceClient {
    pub fn new(client: kube::Client, namespace: &str, timeout: Duration) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            timeout,
        }
    }

    async fn call<T, F>(&self, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await? {
            Ok(value) => Ok(value),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(StoreError::storage(e)),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, name: &str) -> Result<Agent> {
        self.call(name, self.api.get(name)).await
    }

    async fn create(&self, agent: &Agent) -> Result<Agent> {
        self.call(&agent.name_any(), self.api.create(&PostParams::default(), agent))
            .await
    }

    async fn replace(&self, agent: &Agent) -> Result<Agent> {
        let name = agent.name_any();
        self.call(&name, self.api.replace(&name, &PostParams::default(), agent))
            .await
    }

    async fn replace_status(&self, name: &str, status: &AgentStatus) -> Result<Agent> {
        let patch = Patch::Merge(json!({ "status": status }));
        self.call(name, self.api.patch_status(name, &PatchParams::default(), &patch))
            .await
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        let list = self.call("", self.api.list(&ListParams::default())).await?;
        Ok(list.items)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.call(name, self.api.delete(name, &DeleteParams::default())).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn events(&self) -> BoxStream<'static, Result<ResourceEvent>> {
        watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .flat_map(|event| {
                let events: Vec<Result<ResourceEvent>> = match event {
                    Ok(watcher::Event::Applied(agent)) => vec![Ok(ResourceEvent::Applied(agent))],
                    Ok(watcher::Event::Deleted(agent)) => {
                        vec![Ok(ResourceEvent::Deleted(agent.name_any()))]
                    }
                    Ok(watcher::Event::Restarted(agents)) => agents
                        .into_iter()
                        .map(|agent| Ok(ResourceEvent::Applied(agent)))
                        .collect(),
                    Err(e) => vec![Err(StoreError::storage(e))],
                };
                stream::iter(events)
            })
            .boxed()
    }
}
