//! ingestd library
//!
//! The ingest pipeline and its upstream source abstraction. The binary in
//! `main.rs` wires these to an [`FsStore`](stratus_store::FsStore); the
//! edge reuses [`pipeline::IngestPipeline`] for `POST /ingest`.

pub mod config;
pub mod pipeline;
pub mod sources;

pub use pipeline::{IngestError, IngestOptions, IngestOutcome, IngestPipeline};
pub use sources::{FixtureSource, UpstreamSource};
