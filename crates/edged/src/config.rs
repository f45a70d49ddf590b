//! Configuration for edged

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// edged - Stratus edge HTTP daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "edged")]
#[command(about = "Serve the Stratus artifact store over HTTP")]
pub struct Config {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Object-store root directory
    #[arg(short, long, default_value = "./data/store")]
    pub data_dir: PathBuf,

    /// Default timezone for ingest requests and loc-key lookups
    #[arg(long, env = "STRATUS_TIMEZONE", default_value = "UTC")]
    pub timezone: String,

    /// Manifest signing key seed for POST /ingest (64 hex chars)
    #[arg(long, env = "STRATUS_SIGNING_KEY")]
    pub signing_key: Option<String>,

    /// Models ingested by POST /ingest
    #[arg(long, value_delimiter = ',', default_value = "gfs,hrrr")]
    pub models: Vec<String>,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(key) = &self.signing_key {
            if key.len() != 64 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
                anyhow::bail!("signing key must be 64 hex chars");
            }
        }
        if self.timezone.trim().is_empty() {
            anyhow::bail!("timezone cannot be empty");
        }
        Ok(())
    }
}
