//! Liveness tracking for netchecker agents
//!
//! This crate provides the core functionality for:
//! - Accepting agent keepalive reports into a pluggable store
//! - Detecting absent and outdated agents against cluster membership
//! - Lazy cache eviction and periodic keepalive-miss accounting
//! - Per-agent Prometheus metrics and structured logging

pub mod checker;
pub mod config;
pub mod error;
pub mod janitor;
pub mod membership;
pub mod models;
pub mod observability;
pub mod store;

pub use checker::{ConnectivityChecker, ConnectivityReport};
pub use config::{Backend, MembershipConfig, StorageConfig};
pub use error::{Result, StoreError};
pub use janitor::{CacheJanitor, SweepConfig, SweepLoop};
pub use membership::{open_membership, KubeMembership, MembershipSource, StaticMembership};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use store::{open_store, AgentStore, OpenedStore, StalenessPolicy};
