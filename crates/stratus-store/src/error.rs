//! Error types for store backends

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, StoreError>;

/// Object-store error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error from a filesystem-backed store
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed object key
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Transport-level HTTP failure
    #[error("http error: {0}")]
    Http(String),

    /// Unexpected status or body shape from the edge
    #[error("unexpected response for {key}: {detail}")]
    UnexpectedResponse { key: String, detail: String },

    /// A ranged fetch violated the 206/Content-Range contract
    #[error("pack fetch invalid: {0}")]
    PackFetchInvalid(String),

    /// Write attempted against a read-only store
    #[error("store is read-only")]
    ReadOnly,
}
