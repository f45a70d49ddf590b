//! Retention policy
//!
//! Persisted client-side and consulted by reachability and GC. All knobs
//! are clamped into safe ranges on normalization; invalid pins are dropped
//! rather than poisoning retention decisions.

use crate::db::{ClosetDb, DbError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Quota floor: 10 MB.
pub const MIN_QUOTA_BYTES: u64 = 10 * 1024 * 1024;

/// Quota ceiling: 100 GB.
pub const MAX_QUOTA_BYTES: u64 = 100 * 1024 * 1024 * 1024;

/// Window clamp, days.
pub const MIN_WINDOW_DAYS: u32 = 1;
pub const MAX_WINDOW_DAYS: u32 = 365;

const POLICY_META_KEY: &str = "policy";

/// A retention override immune to GC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pin {
    /// Keep every manifest (and its reachable entries) for a date.
    Manifest { date: String },
    /// Keep one blob unconditionally.
    Hash { hash: String },
    /// Keep forecasts on a grid for a deeper window.
    Grid { grid_key: String, days: u32 },
}

/// Client retention policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub window_days: u32,
    pub keep_forecast_runs_days: u32,
    pub keep_observation_days: u32,
    pub quota_bytes: u64,
    pub pins: Vec<Pin>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            window_days: 7,
            keep_forecast_runs_days: 3,
            keep_observation_days: 7,
            quota_bytes: 512 * 1024 * 1024,
            pins: Vec::new(),
        }
    }
}

impl RetentionPolicy {
    /// Clamp every knob into range and drop invalid pins.
    pub fn normalized(mut self) -> Self {
        self.window_days = self.window_days.clamp(MIN_WINDOW_DAYS, MAX_WINDOW_DAYS);
        self.keep_forecast_runs_days = self
            .keep_forecast_runs_days
            .clamp(MIN_WINDOW_DAYS, self.window_days);
        self.keep_observation_days = self
            .keep_observation_days
            .clamp(MIN_WINDOW_DAYS, self.window_days);
        self.quota_bytes = self.quota_bytes.clamp(MIN_QUOTA_BYTES, MAX_QUOTA_BYTES);
        self.pins.retain(|pin| {
            let keep = match pin {
                Pin::Manifest { date } => {
                    NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok()
                }
                Pin::Hash { hash } => {
                    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
                }
                Pin::Grid { grid_key, days } => !grid_key.is_empty() && *days >= 1,
            };
            if !keep {
                warn!(?pin, "dropping invalid pin");
            }
            keep
        });
        for pin in &mut self.pins {
            match pin {
                Pin::Hash { hash } => *hash = hash.to_lowercase(),
                Pin::Grid { days, .. } => *days = (*days).min(MAX_WINDOW_DAYS),
                Pin::Manifest { .. } => {}
            }
        }
        self
    }

    /// Pinned manifest dates.
    pub fn pinned_dates(&self) -> impl Iterator<Item = &str> {
        self.pins.iter().filter_map(|p| match p {
            Pin::Manifest { date } => Some(date.as_str()),
            _ => None,
        })
    }

    /// Pinned blob hashes (already lowercase after normalization).
    pub fn pinned_hashes(&self) -> impl Iterator<Item = &str> {
        self.pins.iter().filter_map(|p| match p {
            Pin::Hash { hash } => Some(hash.as_str()),
            _ => None,
        })
    }

    /// Grid pin depth for a grid key, if any.
    pub fn grid_pin_days(&self, key: &str) -> Option<u32> {
        self.pins
            .iter()
            .filter_map(|p| match p {
                Pin::Grid { grid_key, days } if grid_key == key => Some(*days),
                _ => None,
            })
            .max()
    }

    /// Load the persisted policy, falling back to defaults.
    pub fn load(db: &ClosetDb) -> Result<Self, DbError> {
        match db.get_meta_raw(POLICY_META_KEY)? {
            Some(bytes) => Ok(postcard::from_bytes::<Self>(&bytes)?.normalized()),
            None => Ok(Self::default()),
        }
    }

    /// Persist (normalized).
    pub fn store(&self, db: &ClosetDb) -> Result<Self, DbError> {
        let normalized = self.clone().normalized();
        db.put_meta_raw(POLICY_META_KEY, &postcard::to_allocvec(&normalized)?)?;
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_window_clamps() {
        let policy = RetentionPolicy {
            window_days: 4000,
            keep_forecast_runs_days: 0,
            keep_observation_days: 4000,
            quota_bytes: 1,
            pins: vec![],
        }
        .normalized();

        assert_eq!(policy.window_days, MAX_WINDOW_DAYS);
        assert_eq!(policy.keep_forecast_runs_days, MIN_WINDOW_DAYS);
        assert_eq!(policy.keep_observation_days, MAX_WINDOW_DAYS);
        assert_eq!(policy.quota_bytes, MIN_QUOTA_BYTES);
    }

    #[test]
    fn test_sub_windows_capped_to_window() {
        let policy = RetentionPolicy {
            window_days: 5,
            keep_forecast_runs_days: 30,
            keep_observation_days: 30,
            ..RetentionPolicy::default()
        }
        .normalized();
        assert_eq!(policy.keep_forecast_runs_days, 5);
        assert_eq!(policy.keep_observation_days, 5);
    }

    #[test]
    fn test_invalid_pins_dropped_and_hashes_lowercased() {
        let good_hash = "AB".repeat(32);
        let policy = RetentionPolicy {
            pins: vec![
                Pin::Manifest {
                    date: "not-a-date".into(),
                },
                Pin::Manifest {
                    date: "2026-01-08".into(),
                },
                Pin::Hash {
                    hash: "short".into(),
                },
                Pin::Hash {
                    hash: good_hash.clone(),
                },
                Pin::Grid {
                    grid_key: "".into(),
                    days: 3,
                },
                Pin::Grid {
                    grid_key: "pt:1.0000,2.0000".into(),
                    days: 9000,
                },
            ],
            ..RetentionPolicy::default()
        }
        .normalized();

        assert_eq!(policy.pins.len(), 3);
        assert!(policy
            .pinned_hashes()
            .any(|h| h == good_hash.to_lowercase()));
        assert_eq!(policy.grid_pin_days("pt:1.0000,2.0000"), Some(MAX_WINDOW_DAYS));
        assert_eq!(policy.pinned_dates().collect::<Vec<_>>(), ["2026-01-08"]);
    }

    #[test]
    fn test_store_load_roundtrip() {
        let dir = tempdir().unwrap();
        let db = ClosetDb::open(dir.path()).unwrap();

        assert_eq!(RetentionPolicy::load(&db).unwrap(), RetentionPolicy::default());

        let policy = RetentionPolicy {
            window_days: 14,
            keep_forecast_runs_days: 2,
            keep_observation_days: 10,
            quota_bytes: 64 * 1024 * 1024,
            pins: vec![Pin::Manifest {
                date: "2026-01-08".into(),
            }],
        };
        let stored = policy.store(&db).unwrap();
        assert_eq!(RetentionPolicy::load(&db).unwrap(), stored);
    }
}
