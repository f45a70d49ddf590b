//! edged library
//!
//! The edge HTTP surface over a Stratus object store. Route logic lives in
//! [`routes`]; the binary wires it to an
//! [`FsStore`](stratus_store::FsStore) and an ingest pipeline.

pub mod config;
pub mod routes;

pub use routes::{router, AppState};
