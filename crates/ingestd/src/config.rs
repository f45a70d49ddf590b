//! Configuration for ingestd

use clap::Parser;
use std::path::PathBuf;

/// ingestd - Stratus artifact ingest daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "ingestd")]
#[command(about = "Fetch, package, and publish Stratus weather artifacts")]
pub struct Config {
    /// Object-store root directory
    #[arg(short, long, default_value = "./data/store")]
    pub data_dir: PathBuf,

    /// Primary location latitude
    #[arg(long, env = "STRATUS_LATITUDE", default_value_t = 44.6683, allow_hyphen_values = true)]
    pub latitude: f64,

    /// Primary location longitude
    #[arg(long, env = "STRATUS_LONGITUDE", default_value_t = -65.7619, allow_hyphen_values = true)]
    pub longitude: f64,

    /// Primary location timezone
    #[arg(long, env = "STRATUS_TIMEZONE", default_value = "UTC")]
    pub timezone: String,

    /// Models to ingest (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "gfs,hrrr")]
    pub models: Vec<String>,

    /// Skip forecast ingestion
    #[arg(long)]
    pub skip_forecasts: bool,

    /// Skip observation ingestion
    #[arg(long)]
    pub skip_observations: bool,

    /// Station search radius in kilometers
    #[arg(long, default_value_t = 50.0)]
    pub station_radius_km: f64,

    /// Observation bucket size in minutes
    #[arg(long, default_value_t = 60)]
    pub bucket_minutes: u32,

    /// Manifest signing key seed (64 hex chars)
    #[arg(long, env = "STRATUS_SIGNING_KEY")]
    pub signing_key: Option<String>,

    /// Also publish the manifest and root pointer unscoped (legacy
    /// single-location mode)
    #[arg(long)]
    pub publish_unscoped_mirror: bool,

    /// Seconds between ingest runs
    #[arg(long, default_value = "3600")]
    pub interval_secs: u64,

    /// Run a single ingest cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.latitude.is_finite() || self.latitude.abs() > 90.0 {
            anyhow::bail!("latitude must be finite and within [-90, 90]");
        }
        if !self.longitude.is_finite() || self.longitude.abs() > 180.0 {
            anyhow::bail!("longitude must be finite and within [-180, 180]");
        }
        if self.bucket_minutes == 0 {
            anyhow::bail!("bucket-minutes must be positive");
        }
        if self.skip_forecasts && self.skip_observations {
            anyhow::bail!("nothing to ingest with both forecasts and observations skipped");
        }
        if let Some(key) = &self.signing_key {
            if key.len() != 64 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
                anyhow::bail!("signing key must be 64 hex chars");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::parse_from(["ingestd"])
    }

    #[test]
    fn test_defaults_validate() {
        base().validate().unwrap();
    }

    #[test]
    fn test_bad_coordinates_rejected() {
        let mut config = base();
        config.latitude = 95.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_signing_key_rejected() {
        let mut config = base();
        config.signing_key = Some("abc".into());
        assert!(config.validate().is_err());
        config.signing_key = Some("zz".repeat(32));
        assert!(config.validate().is_err());
        config.signing_key = Some("ab".repeat(32));
        config.validate().unwrap();
    }
}
