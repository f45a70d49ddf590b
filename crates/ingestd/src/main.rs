//! ingestd - Stratus artifact ingest daemon
//!
//! Periodically fetches upstream weather data, packages it into
//! content-addressed blobs, and publishes signed daily manifests.

use clap::Parser;
use ingestd::config::Config;
use ingestd::pipeline::{IngestOptions, IngestPipeline};
use ingestd::sources::FixtureSource;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use stratus_core::manifest::ManifestSigner;
use stratus_store::object_store::FsStore;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ingestd=info".parse().unwrap()))
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "ingestd v{} - Stratus Ingest Daemon",
        env!("CARGO_PKG_VERSION")
    );

    let store = match FsStore::open(&config.data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open object store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let signer = match &config.signing_key {
        Some(seed) => match ManifestSigner::from_seed_hex(seed) {
            Ok(signer) => {
                info!("signing manifests as {}", signer.public_key_hex());
                Some(signer)
            }
            Err(e) => {
                error!("Bad signing key: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let options = IngestOptions {
        models: config.models.clone(),
        include_forecasts: !config.skip_forecasts,
        include_observations: !config.skip_observations,
        station_radius_km: config.station_radius_km,
        bucket_minutes: config.bucket_minutes,
        publish_unscoped_mirror: config.publish_unscoped_mirror,
    };
    let pipeline = IngestPipeline::new(store, Arc::new(FixtureSource::new()), signer, options);

    if config.once {
        return run_once(&pipeline, &config).await;
    }

    let mut ticker = interval(Duration::from_secs(config.interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_once(&pipeline, &config).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    ExitCode::SUCCESS
}

async fn run_once(pipeline: &IngestPipeline, config: &Config) -> ExitCode {
    match pipeline
        .run(config.latitude, config.longitude, &config.timezone)
        .await
    {
        Ok(outcome) => {
            info!(
                date = %outcome.date,
                manifest = %outcome.manifest_hash,
                artifacts = outcome.artifact_hashes.len(),
                "ingest cycle complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Ingest run failed: {e}");
            ExitCode::FAILURE
        }
    }
}
