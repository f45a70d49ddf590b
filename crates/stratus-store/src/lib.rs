//! Stratus store abstractions
//!
//! This crate provides the object-store contract shared by the ingest
//! pipeline, the edge, and the client sync engine, together with the
//! canonical key layout.
//!
//! # Modules
//!
//! - [`object_store`]: the `ObjectStore` trait, `MemoryStore`, `FsStore`
//! - [`http_store`]: read-only client view of a Stratus edge
//! - [`keys`]: canonical key layout and the root-pointer document
//! - [`error`]: error types

pub mod error;
pub mod http_store;
pub mod keys;
pub mod object_store;

pub use error::{Result, StoreError};
pub use http_store::HttpStore;
pub use keys::RootPointer;
pub use object_store::{FsStore, MemoryStore, ObjectStore};
