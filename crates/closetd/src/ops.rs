//! Closet facade and operations layer
//!
//! Wires the DB, vault, blob store, sync engine, and GC behind one handle.
//! Mutating operations require trusted mode (a pinned manifest public
//! key); the read-only snapshot takes no lock and accepts a
//! last-writer-wins view.

use crate::blob_store::BlobStore;
use crate::db::{ClosetDb, SyncState};
use crate::error::{ClientError, Result};
use crate::gc::{
    GcEngine, GcResult, MaintenanceArgs, ReclaimArgs, ReclaimReport, ReconcileReport,
};
use crate::lock::ClosetLock;
use crate::policy::RetentionPolicy;
use crate::reach::ReachabilityInputs;
use crate::sync::{SyncEngine, SyncOptions, SyncProgress};
use crate::vault::BlobVault;
use crate::now_ms;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use stratus_store::object_store::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wiring for a closet instance.
pub struct ClosetConfig {
    pub remote: Arc<dyn ObjectStore>,
    pub scope_id: Option<String>,
    /// Pinned manifest public key (hex). Presence puts the closet in
    /// trusted mode.
    pub pinned_pubkey: Option<String>,
    pub sync_options: SyncOptions,
}

/// Read-only state snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosetSnapshot {
    pub schema_version: u32,
    pub blob_count: usize,
    pub present_count: usize,
    pub pinned_count: usize,
    pub inflight_count: usize,
    pub total_bytes_present: u64,
    pub last_gc_at_ms: Option<i64>,
    pub sync_state: Option<SyncState>,
    pub trusted: bool,
}

/// The closet.
pub struct Closet {
    db: Arc<ClosetDb>,
    vault: Arc<BlobVault>,
    blob_store: Arc<BlobStore>,
    sync_engine: SyncEngine,
    gc: GcEngine,
    lock: ClosetLock,
    policy: RwLock<RetentionPolicy>,
    pinned_pubkey: Option<String>,
}

impl Closet {
    /// Open a closet rooted at `data_dir` (DB and vault live side by
    /// side).
    pub fn open(data_dir: impl AsRef<Path>, config: ClosetConfig) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let db = Arc::new(ClosetDb::open(data_dir.join("db"))?);
        let vault = Arc::new(BlobVault::open(data_dir.join("vault"))?);
        let lock = ClosetLock::in_process();
        let blob_store = Arc::new(BlobStore::new(
            db.clone(),
            vault.clone(),
            config.remote.clone(),
            lock.clone(),
        ));
        let sync_engine = SyncEngine::new(
            config.remote.clone(),
            blob_store.clone(),
            db.clone(),
            vault.clone(),
            lock.clone(),
            config.scope_id,
            config.pinned_pubkey.clone(),
            config.sync_options,
        );
        let gc = GcEngine::new(db.clone(), vault.clone(), config.remote, lock.clone());
        let policy = RwLock::new(RetentionPolicy::load(&db)?);

        Ok(Self {
            db,
            vault,
            blob_store,
            sync_engine,
            gc,
            lock,
            policy,
            pinned_pubkey: config.pinned_pubkey,
        })
    }

    /// Trusted mode: a manifest public key is pinned.
    pub fn trusted(&self) -> bool {
        self.pinned_pubkey.is_some()
    }

    fn require_trusted(&self) -> Result<()> {
        if self.trusted() {
            Ok(())
        } else {
            Err(ClientError::TrustedModeRequired)
        }
    }

    pub fn blob_store(&self) -> &Arc<BlobStore> {
        &self.blob_store
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy.read().clone()
    }

    /// Replace the retention policy (normalized and persisted).
    pub fn set_policy(&self, policy: RetentionPolicy) -> Result<RetentionPolicy> {
        let stored = policy.store(&self.db)?;
        *self.policy.write() = stored.clone();
        Ok(stored)
    }

    /// One sync cycle followed by closet maintenance.
    pub async fn sync_and_maintain(
        &self,
        cancel: &CancellationToken,
        active_hashes: &HashSet<String>,
        force_gc: bool,
    ) -> Result<(SyncProgress, Option<GcResult>)> {
        let outcome = self.sync_engine.sync(cancel).await?;
        let policy = self.policy();
        let gc_result = self
            .gc
            .on_sync_complete(&MaintenanceArgs {
                new_manifests: &outcome.new_manifests,
                new_artifact_hashes: &outcome.new_artifact_hashes,
                policy: &policy,
                trusted: self.trusted(),
                expected_pubkey: self.pinned_pubkey.as_deref(),
                active_hashes,
                force_gc,
                now_ms: now_ms(),
            })
            .await?;
        Ok((outcome.progress, gc_result))
    }

    /// Immediate GC pass. Trusted mode only.
    pub async fn run_gc_now(&self, active_hashes: &HashSet<String>) -> Result<GcResult> {
        self.require_trusted()?;
        let policy = self.policy();
        let inputs = ReachabilityInputs {
            policy: &policy,
            now_ms: now_ms(),
            trusted: true,
            expected_pubkey: self.pinned_pubkey.as_deref(),
            active_hashes,
        };
        self.gc.sweep_and_enforce(&inputs).await
    }

    /// Integrity/orphan reconciliation with fixes applied. Trusted mode
    /// only.
    pub async fn run_reconciliation(&self, fix: bool) -> Result<ReconcileReport> {
        self.require_trusted()?;
        let policy = self.policy();
        self.gc.reconcile_storage(&policy, fix).await
    }

    /// Reclaim vault blobs unknown to the DB. Trusted mode only, plus the
    /// reclaim safety rails.
    pub async fn run_reclaim_true_orphans(
        &self,
        args: &ReclaimArgs<'_>,
    ) -> Result<ReclaimReport> {
        self.require_trusted()?;
        let policy = self.policy();
        self.gc.reclaim_true_orphans(&policy, args).await
    }

    /// Drop every local blob and metadata record. Trusted mode only.
    pub async fn reset_closet(&self) -> Result<()> {
        self.require_trusted()?;
        let _g = self.lock.acquire().await?;
        self.vault.wipe()?;
        self.db.clear_all()?;
        info!("closet reset");
        Ok(())
    }

    /// Read-only snapshot, taken without the lock.
    pub fn snapshot(&self) -> Result<ClosetSnapshot> {
        let blobs = self.db.blobs()?;
        Ok(ClosetSnapshot {
            schema_version: self.db.schema_version()?,
            blob_count: blobs.len(),
            present_count: blobs.iter().filter(|(_, r)| r.present).count(),
            pinned_count: blobs.iter().filter(|(_, r)| r.pinned).count(),
            inflight_count: self.db.inflight()?.len(),
            total_bytes_present: self.db.total_bytes_present()?,
            last_gc_at_ms: self.db.last_gc_at_ms()?,
            sync_state: self.db.sync_state()?,
            trusted: self.trusted(),
        })
    }

    /// Flush persistent state.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{RECLAIM_CONFIRMATION, DEFAULT_INFLIGHT_STALE_MS};
    use ingestd::pipeline::{IngestOptions, IngestPipeline};
    use ingestd::sources::FixtureSource;
    use stratus_core::manifest::ManifestSigner;
    use stratus_store::object_store::MemoryStore;
    use tempfile::tempdir;

    async fn published_cdn(signer: &ManifestSigner) -> (Arc<MemoryStore>, String) {
        let remote = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(
            remote.clone(),
            Arc::new(FixtureSource::new()),
            Some(signer.clone()),
            IngestOptions::default(),
        );
        let outcome = pipeline.run(44.6683, -65.7619, "UTC").await.unwrap();
        (remote, outcome.scope_id)
    }

    fn open_closet(
        dir: &Path,
        remote: Arc<MemoryStore>,
        scope_id: Option<String>,
        pinned_pubkey: Option<String>,
    ) -> Closet {
        Closet::open(
            dir,
            ClosetConfig {
                remote,
                scope_id,
                pinned_pubkey,
                sync_options: SyncOptions::default(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_untrusted_ops_are_refused() {
        let dir = tempdir().unwrap();
        let closet = open_closet(dir.path(), Arc::new(MemoryStore::new()), None, None);
        let active = HashSet::new();

        assert!(matches!(
            closet.run_gc_now(&active).await,
            Err(ClientError::TrustedModeRequired)
        ));
        assert!(matches!(
            closet.run_reconciliation(true).await,
            Err(ClientError::TrustedModeRequired)
        ));
        assert!(matches!(
            closet.reset_closet().await,
            Err(ClientError::TrustedModeRequired)
        ));
        let known: HashSet<String> = [("ff".repeat(32))].into_iter().collect();
        assert!(matches!(
            closet
                .run_reclaim_true_orphans(&ReclaimArgs {
                    confirmation_token: RECLAIM_CONFIRMATION,
                    manifest_known_hashes: Some(&known),
                    danger_skip_manifest_check: None,
                    inflight_stale_ms: DEFAULT_INFLIGHT_STALE_MS,
                    now_ms: 0,
                })
                .await,
            Err(ClientError::TrustedModeRequired)
        ));
        // Snapshot works untrusted.
        assert!(!closet.snapshot().unwrap().trusted);
    }

    #[tokio::test]
    async fn test_sync_and_maintain_end_to_end() {
        let signer = ManifestSigner::generate();
        let (remote, scope_id) = published_cdn(&signer).await;
        let dir = tempdir().unwrap();
        let closet = open_closet(
            dir.path(),
            remote,
            Some(scope_id),
            Some(signer.public_key_hex()),
        );

        let active = HashSet::new();
        let cancel = CancellationToken::new();
        let (progress, gc) = closet
            .sync_and_maintain(&cancel, &active, false)
            .await
            .unwrap();
        assert_eq!(progress.chunks_downloaded, 3);
        // First run: GC interval elapsed (no prior GC), trusted: ran.
        assert!(gc.is_some());
        assert!(gc.unwrap().deleted.is_empty());

        let snapshot = closet.snapshot().unwrap();
        assert_eq!(snapshot.present_count, 4); // 3 artifacts + manifest
        assert!(snapshot.total_bytes_present > 0);
        assert!(snapshot.sync_state.is_some());

        // Idempotent second pass.
        let (progress, _) = closet
            .sync_and_maintain(&cancel, &active, false)
            .await
            .unwrap();
        assert_eq!(progress.chunks_downloaded, 0);
    }

    #[tokio::test]
    async fn test_reset_closet() {
        let signer = ManifestSigner::generate();
        let (remote, scope_id) = published_cdn(&signer).await;
        let dir = tempdir().unwrap();
        let closet = open_closet(
            dir.path(),
            remote,
            Some(scope_id),
            Some(signer.public_key_hex()),
        );
        let cancel = CancellationToken::new();
        let active = HashSet::new();
        closet
            .sync_and_maintain(&cancel, &active, false)
            .await
            .unwrap();
        assert!(closet.snapshot().unwrap().present_count > 0);

        closet.reset_closet().await.unwrap();
        let snapshot = closet.snapshot().unwrap();
        assert_eq!(snapshot.blob_count, 0);
        assert_eq!(snapshot.total_bytes_present, 0);
    }

    #[tokio::test]
    async fn test_policy_roundtrip_through_closet() {
        let dir = tempdir().unwrap();
        let closet = open_closet(dir.path(), Arc::new(MemoryStore::new()), None, None);

        let mut policy = closet.policy();
        policy.window_days = 9000;
        let stored = closet.set_policy(policy).unwrap();
        assert_eq!(stored.window_days, crate::policy::MAX_WINDOW_DAYS);
        assert_eq!(closet.policy(), stored);
    }
}
