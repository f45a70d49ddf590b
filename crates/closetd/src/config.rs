//! Configuration for closetd

use clap::Parser;
use std::path::PathBuf;
use stratus_core::location::{compute_location_scope_id, normalize_location_scope};

/// closetd - Stratus offline-first cache daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "closetd")]
#[command(about = "Stratus client closet: sync, cache, and retention daemon")]
pub struct Config {
    /// Edge/CDN base URL
    #[arg(long, env = "STRATUS_CDN_URL", default_value = "http://127.0.0.1:8080")]
    pub cdn_url: String,

    /// Data directory (closet DB and blob vault)
    #[arg(short, long, default_value = "./data/closet")]
    pub data_dir: PathBuf,

    /// Pinned manifest public key (64 hex chars). Enables trusted mode.
    #[arg(long, env = "STRATUS_MANIFEST_PUBKEY")]
    pub manifest_pubkey: Option<String>,

    /// Days of manifests to sync
    #[arg(long, default_value_t = 7)]
    pub sync_days: u32,

    /// Chunk download concurrency
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Location scope id (64 hex chars); overrides latitude/longitude
    #[arg(long)]
    pub scope_id: Option<String>,

    /// Scope latitude (used with --longitude when --scope-id is absent)
    #[arg(long, allow_hyphen_values = true)]
    pub latitude: Option<f64>,

    /// Scope longitude
    #[arg(long, allow_hyphen_values = true)]
    pub longitude: Option<f64>,

    /// Scope timezone
    #[arg(long, default_value = "UTC")]
    pub timezone: String,

    /// Seconds between sync cycles
    #[arg(long, default_value = "900")]
    pub interval_secs: u64,

    /// Run a single sync cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync_days == 0 {
            anyhow::bail!("sync-days must be positive");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be positive");
        }
        if let Some(key) = &self.manifest_pubkey {
            if key.len() != 64 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
                anyhow::bail!("manifest public key must be 64 hex chars");
            }
        }
        if let Some(scope) = &self.scope_id {
            if scope.len() != 64 || !scope.bytes().all(|b| b.is_ascii_hexdigit()) {
                anyhow::bail!("scope id must be 64 hex chars");
            }
        }
        if self.latitude.is_some() != self.longitude.is_some() {
            anyhow::bail!("latitude and longitude must be given together");
        }
        Ok(())
    }

    /// Resolve the manifest scope: explicit id, or derived from
    /// coordinates, or unscoped.
    pub fn resolve_scope_id(&self) -> anyhow::Result<Option<String>> {
        if let Some(scope_id) = &self.scope_id {
            return Ok(Some(scope_id.to_lowercase()));
        }
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => {
                let scope = normalize_location_scope(lat, lon, Some(&self.timezone), None)?;
                Ok(Some(compute_location_scope_id(&scope)?))
            }
            _ => Ok(None),
        }
    }
}
