//! Reachability
//!
//! Computes the set of blob hashes the closet must keep, given the
//! retention policy, the current time, trust mode, and the set of blobs
//! currently on screen. The computation is read-only: manifests are loaded
//! from the vault, falling back to a verify-only remote read, and nothing
//! is persisted except verification receipts.

use crate::db::{date_start_ms, ClosetDb};
use crate::error::{ClientError, Result};
use crate::policy::RetentionPolicy;
use crate::vault::BlobVault;
use chrono::DateTime;
use std::collections::HashSet;
use stratus_core::envelope::verify_blob;
use stratus_core::hash::Hash32;
use stratus_core::manifest::{unpackage_manifest, verify_manifest_signature};
use stratus_core::ArtifactKind;
use stratus_store::keys::chunk_key;
use stratus_store::object_store::ObjectStore;
use tracing::debug;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Inputs to one reachability pass.
pub struct ReachabilityInputs<'a> {
    pub policy: &'a RetentionPolicy,
    pub now_ms: i64,
    /// Trusted mode: manifests must verify against this pinned key.
    pub trusted: bool,
    pub expected_pubkey: Option<&'a str>,
    /// Blobs currently displayed; kept unconditionally.
    pub active_hashes: &'a HashSet<String>,
}

/// Result of a reachability pass.
#[derive(Debug, Default)]
pub struct ReachableSet {
    pub reachable: HashSet<String>,
    /// Hashes named by retraction notices; subtracted from `reachable`.
    pub blocked: HashSet<String>,
}

impl ReachableSet {
    pub fn contains(&self, hash: &str) -> bool {
        self.reachable.contains(hash)
    }
}

/// Compute the keep-set.
pub async fn compute_reachable(
    db: &ClosetDb,
    vault: &BlobVault,
    remote: &dyn ObjectStore,
    inputs: &ReachabilityInputs<'_>,
) -> Result<ReachableSet> {
    if inputs.trusted && inputs.expected_pubkey.is_none() {
        return Err(ClientError::TrustedModeRequired);
    }

    let policy = inputs.policy;
    let window_cutoff = inputs.now_ms - i64::from(policy.window_days) * DAY_MS;
    let forecast_cutoff = inputs.now_ms - i64::from(policy.keep_forecast_runs_days) * DAY_MS;
    let observation_cutoff = inputs.now_ms - i64::from(policy.keep_observation_days) * DAY_MS;
    let pinned_dates: HashSet<&str> = policy.pinned_dates().collect();

    let mut set = ReachableSet::default();
    let mut reachable_station_sets: HashSet<Hash32> = HashSet::new();
    let mut station_set_entries: Vec<(String, Hash32)> = Vec::new();

    for manifest_ref in db.manifest_refs()? {
        let in_window = date_start_ms(&manifest_ref.date)
            .map(|start| start >= window_cutoff)
            .unwrap_or(false);
        if !in_window && !pinned_dates.contains(manifest_ref.date.as_str()) {
            continue;
        }

        let manifest_hex = manifest_ref.hash.to_hex();
        let blob = load_manifest_blob(vault, remote, &manifest_ref.hash).await?;
        let manifest = unpackage_manifest(&blob, None)?;

        if let Some(pubkey) = inputs.expected_pubkey {
            // Receipts short-circuit re-verification of the same pair.
            if !db.has_verification_receipt(&manifest_hex, pubkey)? {
                verify_manifest_signature(&manifest, Some(pubkey))?;
                db.put_verification_receipt(&manifest_hex, pubkey)?;
            }
        }

        set.reachable.insert(manifest_hex);

        for entry in &manifest.artifacts {
            let entry_hex = entry.hash.to_hex();
            match entry.kind {
                ArtifactKind::Retraction => {
                    set.reachable.insert(entry_hex);
                    if let Some(target) = &entry.retracted_hash {
                        set.blocked.insert(target.to_hex());
                    }
                }
                ArtifactKind::Forecast => {
                    let cutoff = entry
                        .grid_key
                        .as_deref()
                        .and_then(|k| policy.grid_pin_days(k))
                        .map(|days| inputs.now_ms - i64::from(days) * DAY_MS)
                        .map_or(forecast_cutoff, |pinned| pinned.min(forecast_cutoff));
                    if instant_ms(entry.run_time.as_deref()) >= Some(cutoff) {
                        set.reachable.insert(entry_hex);
                    }
                }
                ArtifactKind::Observation => {
                    if instant_ms(entry.observed_at_bucket.as_deref()) >= Some(observation_cutoff)
                    {
                        set.reachable.insert(entry_hex);
                        if let Some(set_id) = &entry.station_set_id {
                            reachable_station_sets.insert(*set_id);
                        }
                    }
                }
                ArtifactKind::StationSet => {
                    // Promoted only when a kept observation references it.
                    station_set_entries.push((entry_hex, entry.hash));
                }
                ArtifactKind::Metadata => {
                    // Follows the manifest window.
                    set.reachable.insert(entry_hex);
                }
            }
        }
    }

    for (hex, hash) in station_set_entries {
        if reachable_station_sets.contains(&hash) {
            set.reachable.insert(hex);
        }
    }

    for pinned in policy.pinned_hashes() {
        set.reachable.insert(pinned.to_lowercase());
    }
    for active in inputs.active_hashes {
        set.reachable.insert(active.to_lowercase());
    }

    for blocked in &set.blocked {
        set.reachable.remove(blocked);
    }

    debug!(
        reachable = set.reachable.len(),
        blocked = set.blocked.len(),
        "reachability computed"
    );
    Ok(set)
}

/// Load a manifest blob without mutating closet state: vault first, then a
/// hash-verified remote read.
async fn load_manifest_blob(
    vault: &BlobVault,
    remote: &dyn ObjectStore,
    hash: &Hash32,
) -> Result<Vec<u8>> {
    let hex = hash.to_hex();
    if let Some(bytes) = vault.get(&hex)? {
        return Ok(bytes);
    }
    let bytes = remote
        .get(&chunk_key(hash))
        .await?
        .ok_or_else(|| ClientError::NotFound(hex.clone()))?;
    verify_blob(&bytes, hash).map_err(|e| ClientError::Integrity {
        hash: hex,
        reason: e.to_string(),
    })?;
    Ok(bytes)
}

/// Epoch milliseconds of an ISO-8601 instant; `None` for absent or
/// unparseable input (which never satisfies a cutoff).
fn instant_ms(iso: Option<&str>) -> Option<i64> {
    iso.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
}
