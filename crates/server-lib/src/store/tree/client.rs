//! Key operations against the distributed tree store

use crate::error::{Result, StoreError};
use async_trait::async_trait;
use etcd_client::{Client as EtcdClient, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use std::time::Duration;
use tracing::info;

/// One key/value pair returned by a prefix scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub key: String,
    pub value: Vec<u8>,
}

#[async_trait]
pub trait TreeClient: Send + Sync {
    /// Unconditional write; with a `ttl` the key expires on its own
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Write only if the key does not exist yet. Returns false if it did.
    async fn create(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every live key under `prefix`
    async fn scan(&self, prefix: &str) -> Result<Vec<TreeNode>>;
}

/// `TreeClient` over etcd v3; expiry is implemented with leases
pub struct EtcdTreeClient {
    client: EtcdClient,
    timeout: Duration,
}

impl EtcdTreeClient {
    pub async fn connect(endpoints: &[String], timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::StartupFailure(
                "no etcd endpoints configured".to_string(),
            ));
        }
        info!(endpoints = ?endpoints, "Connecting to etcd");
        let client = tokio::time::timeout(timeout, EtcdClient::connect(endpoints, None))
            .await
            .map_err(|_| StoreError::StartupFailure("etcd connection timed out".to_string()))?
            .map_err(|e| StoreError::StartupFailure(format!("failed to connect to etcd: {e}")))?;

        Ok(Self { client, timeout })
    }

    async fn grant(&self, ttl: Duration) -> Result<i64> {
        let mut client = self.client.clone();
        let grant = client.lease_grant(ttl.as_secs() as i64, None);
        let lease = tokio::time::timeout(self.timeout, grant)
            .await?
            .map_err(StoreError::storage)?;
        Ok(lease.id())
    }
}

#[async_trait]
impl TreeClient for EtcdTreeClient {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let options = match ttl {
            Some(ttl) => Some(PutOptions::new().with_lease(self.grant(ttl).await?)),
            None => None,
        };
        let mut client = self.client.clone();
        tokio::time::timeout(self.timeout, client.put(key, value, options))
            .await?
            .map_err(StoreError::storage)?;
        Ok(())
    }

    async fn create(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let lease = self.grant(ttl).await?;
        let txn = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease)),
            )]);

        let mut client = self.client.clone();
        let resp = tokio::time::timeout(self.timeout, client.txn(txn))
            .await?
            .map_err(StoreError::storage)?;
        Ok(resp.succeeded())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = tokio::time::timeout(self.timeout, client.get(key, None))
            .await?
            .map_err(StoreError::storage)?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<TreeNode>> {
        let mut client = self.client.clone();
        let resp = tokio::time::timeout(
            self.timeout,
            client.get(prefix, Some(GetOptions::new().with_prefix())),
        )
        .await?
        .map_err(StoreError::storage)?;

        resp.kvs()
            .iter()
            .map(|kv| {
                Ok(TreeNode {
                    key: kv.key_str().map_err(StoreError::storage)?.to_string(),
                    value: kv.value().to_vec(),
                })
            })
            .collect()
    }
}
