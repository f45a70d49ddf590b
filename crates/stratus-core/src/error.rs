//! Error types for Stratus core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Stratus core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input (coordinates, keys, dates)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A value the canonical encoder refuses to represent
    #[error("invalid value for canonical encoding: {0}")]
    InvalidValue(String),

    /// Blob shorter than the fixed envelope header
    #[error("blob too small: {0} bytes")]
    TooSmall(usize),

    /// Envelope magic mismatch
    #[error("bad magic: 0x{0:08x}")]
    BadMagic(u32),

    /// Schema version outside the supported range
    #[error("unsupported schema version: {0}")]
    SchemaUnsupported(u16),

    /// Encoding flag not present in the registry
    #[error("unknown encoding flags: 0x{0:08x}")]
    UnknownEncoding(u32),

    /// Decompressed payload size differs from the header
    #[error("size mismatch: header says {expected} bytes, payload is {actual}")]
    SizeMismatch { expected: u32, actual: usize },

    /// Recomputed hash differs from the id in the header
    #[error("integrity mismatch: computed {computed} != header {header}")]
    IntegrityMismatch { computed: String, header: String },

    /// Record decode failure after a structurally valid envelope
    #[error("decode error: {0}")]
    Decode(String),

    /// Ed25519 signature did not verify
    #[error("invalid signature")]
    InvalidSignature,

    /// Signer public key differs from the pinned key
    #[error("unexpected signer: {0}")]
    UnexpectedSigner(String),

    /// A signature was required but absent
    #[error("manifest is unsigned")]
    Unsigned,

    /// Invalid public key or signature material
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
