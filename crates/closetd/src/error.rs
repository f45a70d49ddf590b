//! Error types for the closet

use crate::db::DbError;
use crate::lock::LockError;
use crate::vault::VaultError;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, ClientError>;

/// Closet-side error types
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("core error: {0}")]
    Core(#[from] stratus_core::Error),

    #[error("store error: {0}")]
    Store(#[from] stratus_store::StoreError),

    #[error("db error: {0}")]
    Db(#[from] DbError),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Blob absent both locally and remotely
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Downloaded bytes did not verify against the requested id
    #[error("integrity failure for {hash}: {reason}")]
    Integrity { hash: String, reason: String },

    /// Operation cancelled through its abort signal
    #[error("operation aborted")]
    Aborted,

    /// A trusted-mode operation was attempted without a pinned public key
    #[error("operation requires trusted mode (pinned manifest public key)")]
    TrustedModeRequired,

    /// Reclaim safety rails refused the request
    #[error("reclaim refused: {0}")]
    ReclaimRefused(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
