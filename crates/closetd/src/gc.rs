//! Garbage collection, quota enforcement, and storage reconciliation
//!
//! Every mutating operation here runs under the closet lock. Deletion
//! order is total, `(lastAccess ASC, hash ASC)`, so two GC runs over
//! identical state produce identical deletion sequences. If reachability
//! cannot be computed, nothing is deleted in that pass.

use crate::db::ClosetDb;
use crate::error::{ClientError, Result};
use crate::lock::ClosetLock;
use crate::policy::RetentionPolicy;
use crate::reach::{compute_reachable, ReachabilityInputs};
use crate::vault::BlobVault;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use stratus_core::hash::Hash32;
use stratus_core::manifest::Manifest;
use stratus_core::ArtifactKind;
use stratus_store::object_store::ObjectStore;
use tracing::{debug, info, warn};

/// GC runs at most this often without an explicit trigger.
pub const GC_INTERVAL_MS: i64 = 6 * 60 * 60 * 1000;

/// Inflight entries older than this may be reclaimed in danger mode.
pub const DEFAULT_INFLIGHT_STALE_MS: i64 = 30 * 60 * 1000;

/// Literal confirmation token required by `reclaim_true_orphans`.
pub const RECLAIM_CONFIRMATION: &str = "RECLAIM";

/// Literal acknowledgment for reclaiming without manifest proof.
pub const RECLAIM_DANGER_ACK: &str = "I_UNDERSTAND_DATA_LOSS_RISK";

/// Result of one sweep/quota pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcResult {
    /// Hashes deleted, in deletion order.
    pub deleted: Vec<String>,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Set when the quota walk exhausted its candidates while still over
    /// quota. Reported, never thrown.
    pub cannot_satisfy_quota: bool,
}

/// Report from `reconcile_storage`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Blobs recorded present whose vault file is gone.
    pub missing_marked: Vec<String>,
    /// Blobs whose recorded size disagreed with the vault.
    pub size_corrected: Vec<String>,
    /// Soft orphans (present=0 in DB, bytes in vault) deleted.
    pub soft_orphans_deleted: Vec<String>,
    /// Vault hashes unknown to the DB. Reported only, never deleted here.
    pub true_orphans: Vec<String>,
    /// `totalBytesPresent` recomputed from DB truth.
    pub total_bytes_present: u64,
}

/// Arguments to `reclaim_true_orphans`.
pub struct ReclaimArgs<'a> {
    pub confirmation_token: &'a str,
    /// Hashes seen in verified manifests; members are preserved.
    pub manifest_known_hashes: Option<&'a HashSet<String>>,
    /// The explicit danger acknowledgment literal, when skipping the
    /// manifest check.
    pub danger_skip_manifest_check: Option<&'a str>,
    pub inflight_stale_ms: i64,
    pub now_ms: i64,
}

/// Report from `reclaim_true_orphans`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub reclaimed: Vec<String>,
    pub preserved: Vec<String>,
}

/// Post-sync maintenance arguments.
pub struct MaintenanceArgs<'a> {
    pub new_manifests: &'a [(Hash32, Manifest)],
    pub new_artifact_hashes: &'a [Hash32],
    pub policy: &'a RetentionPolicy,
    pub trusted: bool,
    pub expected_pubkey: Option<&'a str>,
    pub active_hashes: &'a HashSet<String>,
    pub force_gc: bool,
    pub now_ms: i64,
}

pub struct GcEngine {
    db: Arc<ClosetDb>,
    vault: Arc<BlobVault>,
    remote: Arc<dyn ObjectStore>,
    lock: ClosetLock,
}

impl GcEngine {
    pub fn new(
        db: Arc<ClosetDb>,
        vault: Arc<BlobVault>,
        remote: Arc<dyn ObjectStore>,
        lock: ClosetLock,
    ) -> Self {
        Self {
            db,
            vault,
            remote,
            lock,
        }
    }

    /// Mark-and-sweep plus quota enforcement, as one locked operation.
    pub async fn sweep_and_enforce(
        &self,
        inputs: &ReachabilityInputs<'_>,
    ) -> Result<GcResult> {
        let _g = self.lock.acquire().await?;

        let bytes_before = self.db.total_bytes_present()?;
        // Reachability errors abort the pass before any deletion.
        let reachable = compute_reachable(
            &self.db,
            &self.vault,
            self.remote.as_ref(),
            inputs,
        )
        .await?;
        let inflight: HashSet<String> =
            self.db.inflight()?.into_iter().map(|(h, _)| h).collect();

        let mut bytes = bytes_before;
        let mut deleted = Vec::new();

        // Sweep: everything not pinned, reachable, or inflight goes.
        self.delete_candidates(
            &reachable.reachable,
            &inflight,
            &mut bytes,
            &mut deleted,
            None,
        )?;

        // Quota: walk the same total order until under quota or exhausted.
        let quota = inputs.policy.quota_bytes;
        let mut cannot_satisfy_quota = false;
        if bytes > quota {
            self.delete_candidates(
                &reachable.reachable,
                &inflight,
                &mut bytes,
                &mut deleted,
                Some(quota),
            )?;
            cannot_satisfy_quota = bytes > quota;
        }

        self.db.set_total_bytes_present(bytes)?;
        self.db.set_last_gc_at_ms(inputs.now_ms)?;

        info!(
            deleted = deleted.len(),
            bytes_before,
            bytes_after = bytes,
            cannot_satisfy_quota,
            "gc pass complete"
        );
        Ok(GcResult {
            deleted,
            bytes_before,
            bytes_after: bytes,
            cannot_satisfy_quota,
        })
    }

    /// Quota enforcement alone, against an externally supplied keep-set.
    pub async fn enforce_quota(
        &self,
        quota_bytes: u64,
        reachable: &HashSet<String>,
    ) -> Result<GcResult> {
        let _g = self.lock.acquire().await?;
        let bytes_before = self.db.total_bytes_present()?;
        let inflight: HashSet<String> =
            self.db.inflight()?.into_iter().map(|(h, _)| h).collect();

        let mut bytes = bytes_before;
        let mut deleted = Vec::new();
        let mut cannot_satisfy_quota = false;
        if bytes > quota_bytes {
            self.delete_candidates(
                reachable,
                &inflight,
                &mut bytes,
                &mut deleted,
                Some(quota_bytes),
            )?;
            cannot_satisfy_quota = bytes > quota_bytes;
        }
        self.db.set_total_bytes_present(bytes)?;

        Ok(GcResult {
            deleted,
            bytes_before,
            bytes_after: bytes,
            cannot_satisfy_quota,
        })
    }

    /// Delete present blobs that are not pinned, not reachable, and not
    /// inflight, walking `(lastAccess ASC, hash ASC)`. With `stop_at`,
    /// stops as soon as `bytes` drops to the target.
    fn delete_candidates(
        &self,
        reachable: &HashSet<String>,
        inflight: &HashSet<String>,
        bytes: &mut u64,
        deleted: &mut Vec<String>,
        stop_at: Option<u64>,
    ) -> Result<()> {
        for (hash, mut record) in self.db.blobs_by_access()? {
            if let Some(target) = stop_at {
                if *bytes <= target {
                    break;
                }
            }
            if !record.present
                || record.pinned
                || reachable.contains(&hash)
                || inflight.contains(&hash)
            {
                continue;
            }
            self.vault.delete(&hash)?;
            record.present = false;
            self.db.put_blob(&hash, &record)?;
            *bytes = bytes.saturating_sub(record.size_bytes);
            deleted.push(hash);
        }
        Ok(())
    }

    /// Post-sync maintenance: index what arrived, stamp access, and run GC
    /// when a trigger fires. GC is disabled outside trusted mode because
    /// retention cannot be proven over unverified manifests.
    pub async fn on_sync_complete(
        &self,
        args: &MaintenanceArgs<'_>,
    ) -> Result<Option<GcResult>> {
        {
            let _g = self.lock.acquire().await?;

            for (hash, manifest) in args.new_manifests {
                let hex = hash.to_hex();
                self.db
                    .upsert_manifest_ref(&manifest.date, "daily", &hex, hash)?;
                for entry in &manifest.artifacts {
                    match entry.kind {
                        ArtifactKind::Observation => {
                            if let (Some(source), Some(bucket), Some(minutes), Some(set_id)) = (
                                entry.source.as_deref(),
                                entry.observed_at_bucket.as_deref(),
                                entry.bucket_minutes,
                                entry.station_set_id.as_ref(),
                            ) {
                                self.db.upsert_observation_ref(
                                    source,
                                    bucket,
                                    minutes,
                                    set_id,
                                    &entry.hash,
                                )?;
                            }
                        }
                        ArtifactKind::Forecast => {
                            if let (Some(model), Some(run_time), Some(grid_key)) = (
                                entry.model.as_deref(),
                                entry.run_time.as_deref(),
                                entry.grid_key.as_deref(),
                            ) {
                                self.db.upsert_forecast_ref(
                                    model,
                                    run_time,
                                    grid_key,
                                    &entry.hash,
                                )?;
                            }
                        }
                        _ => {}
                    }
                }
            }

            for hash in args.new_artifact_hashes {
                let hex = hash.to_hex();
                if let Some(mut record) = self.db.get_blob(&hex)? {
                    record.present = true;
                    record.last_access_ms = args.now_ms;
                    self.db.put_blob(&hex, &record)?;
                }
            }
            for hash in args.active_hashes {
                if let Some(mut record) = self.db.get_blob(hash)? {
                    record.last_access_ms = args.now_ms;
                    self.db.put_blob(hash, &record)?;
                }
            }
        }

        let bytes = self.db.total_bytes_present()?;
        let last_gc = self.db.last_gc_at_ms()?.unwrap_or(0);
        let due = args.force_gc
            || bytes > args.policy.quota_bytes
            || args.now_ms - last_gc > GC_INTERVAL_MS;
        if !due {
            return Ok(None);
        }
        if !args.trusted {
            debug!("gc trigger ignored: not in trusted mode");
            return Ok(None);
        }

        let inputs = ReachabilityInputs {
            policy: args.policy,
            now_ms: args.now_ms,
            trusted: args.trusted,
            expected_pubkey: args.expected_pubkey,
            active_hashes: args.active_hashes,
        };
        Ok(Some(self.sweep_and_enforce(&inputs).await?))
    }

    /// Two-pass integrity/orphan reconciliation, then recompute
    /// `totalBytesPresent` from DB truth.
    pub async fn reconcile_storage(
        &self,
        policy: &RetentionPolicy,
        fix: bool,
    ) -> Result<ReconcileReport> {
        let _g = self.lock.acquire().await?;
        let mut report = ReconcileReport::default();

        // Pass 1: integrity of present records against the vault.
        for (hash, mut record) in self.db.blobs()? {
            if !record.present {
                continue;
            }
            match self.vault.stat(&hash)? {
                None => {
                    if fix {
                        record.present = false;
                        self.db.put_blob(&hash, &record)?;
                    }
                    report.missing_marked.push(hash);
                }
                Some(size) if size != record.size_bytes => {
                    if fix {
                        record.size_bytes = size;
                        self.db.put_blob(&hash, &record)?;
                    }
                    report.size_corrected.push(hash);
                }
                Some(_) => {}
            }
        }

        // Pass 2: vault orphans.
        let pinned: HashSet<String> = policy.pinned_hashes().map(str::to_string).collect();
        for hash in self.vault.all_hashes()? {
            match self.db.get_blob(&hash)? {
                Some(record) if !record.present => {
                    // Soft orphan: DB knows it, says absent.
                    if fix && !record.pinned && !pinned.contains(&hash) {
                        self.vault.delete(&hash)?;
                        report.soft_orphans_deleted.push(hash);
                    }
                }
                Some(_) => {}
                None => {
                    // True orphan: reported, never deleted here.
                    report.true_orphans.push(hash);
                }
            }
        }

        // Pass 3: recompute the byte total from DB truth.
        let total: u64 = self
            .db
            .blobs()?
            .into_iter()
            .filter(|(_, r)| r.present)
            .map(|(_, r)| r.size_bytes)
            .sum();
        if fix {
            self.db.set_total_bytes_present(total)?;
        }
        report.total_bytes_present = total;

        report.missing_marked.sort();
        report.size_corrected.sort();
        report.true_orphans.sort();
        Ok(report)
    }

    /// The only path that may delete blobs unknown to the DB.
    ///
    /// Safety rails, all required: the literal confirmation token; either a
    /// manifest-derived known-hash set (members preserved) or the explicit
    /// danger acknowledgment; pinned hashes always preserved; inflight
    /// preserved (danger mode may reclaim only stale inflight).
    pub async fn reclaim_true_orphans(
        &self,
        policy: &RetentionPolicy,
        args: &ReclaimArgs<'_>,
    ) -> Result<ReclaimReport> {
        if args.confirmation_token != RECLAIM_CONFIRMATION {
            return Err(ClientError::ReclaimRefused(
                "confirmation token mismatch".into(),
            ));
        }
        let danger = match args.danger_skip_manifest_check {
            Some(RECLAIM_DANGER_ACK) => true,
            Some(_) => {
                return Err(ClientError::ReclaimRefused(
                    "unrecognized danger acknowledgment".into(),
                ))
            }
            None => false,
        };
        let known = args.manifest_known_hashes;
        if !danger && known.map_or(true, |k| k.is_empty()) {
            return Err(ClientError::ReclaimRefused(
                "manifest known-hash set required without danger acknowledgment".into(),
            ));
        }

        let _g = self.lock.acquire().await?;
        let pinned: HashSet<String> = policy.pinned_hashes().map(str::to_string).collect();
        let inflight: HashMap<String, i64> = self.db.inflight()?.into_iter().collect();

        let mut report = ReclaimReport::default();
        for hash in self.vault.all_hashes()? {
            if self.db.get_blob(&hash)?.is_some() {
                continue; // known to the DB, not a true orphan
            }
            if pinned.contains(&hash) {
                report.preserved.push(hash);
                continue;
            }
            if let Some(started_at) = inflight.get(&hash) {
                let stale = args.now_ms - started_at > args.inflight_stale_ms;
                if !(danger && stale) {
                    report.preserved.push(hash);
                    continue;
                }
            }
            if !danger && known.is_some_and(|k| k.contains(&hash)) {
                report.preserved.push(hash);
                continue;
            }
            self.vault.delete(&hash)?;
            report.reclaimed.push(hash);
        }

        if !report.reclaimed.is_empty() {
            warn!(
                reclaimed = report.reclaimed.len(),
                danger, "true orphans reclaimed"
            );
        }
        Ok(report)
    }
}
