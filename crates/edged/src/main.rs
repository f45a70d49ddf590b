//! edged - Stratus edge HTTP daemon
//!
//! Serves content-addressed blobs, manifest listings, and chain-head
//! pointers from the object store, plus the ingest endpoint.

use clap::Parser;
use edged::config::Config;
use edged::routes::{router, AppState};
use ingestd::pipeline::{IngestOptions, IngestPipeline};
use ingestd::sources::FixtureSource;
use std::process::ExitCode;
use std::sync::Arc;
use stratus_core::manifest::ManifestSigner;
use stratus_store::object_store::FsStore;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("edged=info".parse().unwrap()))
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!("edged v{} - Stratus Edge Daemon", env!("CARGO_PKG_VERSION"));

    let store = match FsStore::open(&config.data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open object store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let signer = match &config.signing_key {
        Some(seed) => match ManifestSigner::from_seed_hex(seed) {
            Ok(signer) => Some(signer),
            Err(e) => {
                error!("Bad signing key: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };
    let ingest = Arc::new(IngestPipeline::new(
        store.clone(),
        Arc::new(FixtureSource::new()),
        signer,
        IngestOptions {
            models: config.models.clone(),
            ..IngestOptions::default()
        },
    ));

    let app = router(AppState {
        store,
        ingest,
        default_timezone: config.timezone.clone(),
    });

    let listener = match tokio::net::TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Bind failed on {}: {e}", config.listen);
            return ExitCode::FAILURE;
        }
    };
    info!("Listening on {}", config.listen);

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
