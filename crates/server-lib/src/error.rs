//! Error taxonomy shared by every storage backend

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed or out-of-range input; never retried
    #[error("invalid agent record: {0}")]
    InvalidRecord(String),

    /// No record stored under the identity
    #[error("agent {0} not found")]
    NotFound(String),

    /// Backing medium unreachable or timed out
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Listing the expected agents failed
    #[error("membership unavailable: {0}")]
    MembershipUnavailable(String),

    /// Backend bootstrap failed; the process cannot serve
    #[error("startup failure: {0}")]
    StartupFailure(String),
}

impl StoreError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Transient infrastructure failures that a later attempt may not hit
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::StorageUnavailable(_) | StoreError::MembershipUnavailable(_)
        )
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::StorageUnavailable("remote call timed out".to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidRecord(err.to_string())
    }
}
