//! closetd - Stratus offline-first cache daemon
//!
//! Periodically pulls manifests and chunks from a Stratus edge, verifies
//! them, and maintains the local closet under its retention policy.

use clap::Parser;
use closetd::config::Config;
use closetd::{Closet, ClosetConfig};
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use stratus_store::http_store::HttpStore;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("closetd=info".parse().unwrap()))
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }
    let scope_id = match config.resolve_scope_id() {
        Ok(scope_id) => scope_id,
        Err(e) => {
            error!("Bad scope: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "closetd v{} - Stratus Closet Daemon",
        env!("CARGO_PKG_VERSION")
    );

    let remote = Arc::new(HttpStore::new(&config.cdn_url));
    let closet = match Closet::open(
        &config.data_dir,
        ClosetConfig {
            remote,
            scope_id,
            pinned_pubkey: config.manifest_pubkey.clone().map(|k| k.to_lowercase()),
            sync_options: closetd::sync::SyncOptions {
                sync_days: config.sync_days,
                concurrency: config.concurrency,
            },
        },
    ) {
        Ok(closet) => Arc::new(closet),
        Err(e) => {
            error!("Failed to open closet: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !closet.trusted() {
        info!("no manifest public key pinned; GC and maintenance are disabled");
    }

    let flusher = closet.blob_store().spawn_access_flusher();
    let cancel = CancellationToken::new();
    let active: HashSet<String> = HashSet::new();

    if config.once {
        let code = run_cycle(&closet, &cancel, &active).await;
        flusher.abort();
        let _ = closet.flush();
        return code;
    }

    let mut ticker = interval(Duration::from_secs(config.interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_cycle(&closet, &cancel, &active).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
        }
    }

    flusher.abort();
    if let Err(e) = closet.flush() {
        error!("Flush failed: {e}");
    }
    ExitCode::SUCCESS
}

async fn run_cycle(
    closet: &Closet,
    cancel: &CancellationToken,
    active: &HashSet<String>,
) -> ExitCode {
    match closet.sync_and_maintain(cancel, active, false).await {
        Ok((progress, gc)) => {
            info!(
                manifests = progress.manifests_fetched,
                chunks = progress.chunks_downloaded,
                failures = progress.chunk_failures,
                gc_deleted = gc.as_ref().map(|g| g.deleted.len()).unwrap_or(0),
                "sync cycle complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Sync cycle failed: {e}");
            ExitCode::FAILURE
        }
    }
}
