//! Sync engine
//!
//! Stateless, resumable pull sync: read the chain head, walk the date
//! window, fetch and verify manifests, then download missing chunks with a
//! bounded pool. Every chunk download follows the three-phase inflight
//! protocol so GC and reclaim can never race a half-committed blob:
//!
//! - Phase I (under lock): mark the hash inflight
//! - Phase II (no lock): fetch and hash-verify
//! - Phase III (under lock): commit to the vault and clear inflight
//!
//! Failures in II or III still clear the inflight mark under the lock.

use crate::blob_store::{store_blob_locked, BlobStore};
use crate::db::{ClosetDb, SyncState};
use crate::error::{ClientError, Result};
use crate::lock::ClosetLock;
use crate::now_ms;
use chrono::{Duration as ChronoDuration, NaiveDate};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use stratus_core::envelope::{artifact_id_of, verify_blob};
use stratus_core::hash::Hash32;
use stratus_core::manifest::{unpackage_manifest, Manifest};
use stratus_store::keys::{chunk_key, manifest_dir_key, root_pointer_key, RootPointer};
use stratus_store::object_store::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sync options.
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Days of manifests to pull, counting back from the chain head.
    pub sync_days: u32,
    /// Width of the chunk download pool.
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sync_days: 7,
            concurrency: 4,
        }
    }
}

/// Counters for one sync run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub manifests_fetched: usize,
    pub manifest_failures: usize,
    pub chunks_downloaded: usize,
    pub chunk_failures: usize,
    pub bytes_downloaded: u64,
    pub last_synced_date: Option<String>,
}

/// Everything one sync run produced, for post-sync maintenance.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub progress: SyncProgress,
    /// Manifests fetched this run (hash, parsed record).
    pub new_manifests: Vec<(Hash32, Manifest)>,
    /// Chunk hashes downloaded this run.
    pub new_artifact_hashes: Vec<Hash32>,
}

pub struct SyncEngine {
    remote: Arc<dyn ObjectStore>,
    blob_store: Arc<BlobStore>,
    db: Arc<ClosetDb>,
    vault: Arc<crate::vault::BlobVault>,
    lock: ClosetLock,
    scope_id: Option<String>,
    pinned_pubkey: Option<String>,
    options: SyncOptions,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn ObjectStore>,
        blob_store: Arc<BlobStore>,
        db: Arc<ClosetDb>,
        vault: Arc<crate::vault::BlobVault>,
        lock: ClosetLock,
        scope_id: Option<String>,
        pinned_pubkey: Option<String>,
        options: SyncOptions,
    ) -> Self {
        Self {
            remote,
            blob_store,
            db,
            vault,
            lock,
            scope_id,
            pinned_pubkey,
            options,
        }
    }

    /// Run one sync cycle.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncOutcome> {
        if cancel.is_cancelled() {
            return Err(ClientError::Aborted);
        }
        let mut outcome = SyncOutcome::default();

        // Chain head. Absence is an empty CDN (or an unpublished scope),
        // not an error.
        let root_key = root_pointer_key(self.scope_id.as_deref());
        let Some(pointer_bytes) = self.remote.get(&root_key).await? else {
            debug!(%root_key, "no root pointer, nothing to sync");
            return Ok(outcome);
        };
        let pointer: RootPointer = serde_json::from_slice(&pointer_bytes)
            .map_err(|e| ClientError::InvalidInput(format!("corrupt root pointer: {e}")))?;

        let latest = NaiveDate::parse_from_str(&pointer.latest, "%Y-%m-%d")
            .map_err(|e| ClientError::InvalidInput(format!("bad root date: {e}")))?;
        let first = latest - ChronoDuration::days(i64::from(self.options.sync_days) - 1);

        // Manifests, oldest date first.
        let mut manifests: Vec<(Hash32, Manifest)> = Vec::new();
        let mut date = first;
        while date <= latest {
            if cancel.is_cancelled() {
                return Err(ClientError::Aborted);
            }
            self.sync_date(&date.format("%Y-%m-%d").to_string(), &mut manifests, &mut outcome)
                .await?;
            date += ChronoDuration::days(1);
        }

        // Want-set: every entry hash not yet present, first-seen order.
        let mut seen: HashSet<Hash32> = HashSet::new();
        let mut want: Vec<Hash32> = Vec::new();
        for (_, manifest) in &manifests {
            for entry in &manifest.artifacts {
                if !seen.insert(entry.hash) {
                    continue;
                }
                let present = self
                    .db
                    .get_blob(&entry.hash.to_hex())?
                    .map(|r| r.present)
                    .unwrap_or(false);
                if !present {
                    want.push(entry.hash);
                }
            }
        }
        debug!(want = want.len(), "assembled want-set");

        // Bounded download pool.
        let mut pending = want.into_iter();
        let mut pool = FuturesUnordered::new();
        loop {
            while pool.len() < self.options.concurrency.max(1) {
                if cancel.is_cancelled() {
                    // Let in-flight downloads finish their lock-held tails.
                    break;
                }
                let Some(hash) = pending.next() else { break };
                pool.push(self.download_chunk(hash, cancel));
            }
            let Some(finished) = pool.next().await else {
                break;
            };
            match finished {
                Ok((hash, bytes)) => {
                    outcome.progress.chunks_downloaded += 1;
                    outcome.progress.bytes_downloaded += bytes;
                    outcome.new_artifact_hashes.push(hash);
                }
                Err(ClientError::Aborted) => {
                    // Drain whatever is still in flight, then propagate.
                    while let Some(rest) = pool.next().await {
                        if let Ok((hash, bytes)) = rest {
                            outcome.progress.chunks_downloaded += 1;
                            outcome.progress.bytes_downloaded += bytes;
                            outcome.new_artifact_hashes.push(hash);
                        }
                    }
                    return Err(ClientError::Aborted);
                }
                Err(e) => {
                    outcome.progress.chunk_failures += 1;
                    warn!(error = %e, "chunk download failed");
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(ClientError::Aborted);
        }

        outcome.progress.last_synced_date = Some(pointer.latest.clone());

        // Persist sync state.
        let previous = self.db.sync_state()?.unwrap_or_default();
        self.db.set_sync_state(&SyncState {
            last_synced_date: pointer.latest,
            last_synced_at_ms: now_ms(),
            manifests_fetched: previous.manifests_fetched
                + outcome.progress.manifests_fetched as u64,
            chunks_downloaded: previous.chunks_downloaded
                + outcome.progress.chunks_downloaded as u64,
        })?;

        info!(
            manifests = outcome.progress.manifests_fetched,
            chunks = outcome.progress.chunks_downloaded,
            failures = outcome.progress.chunk_failures,
            "sync complete"
        );
        Ok(outcome)
    }

    /// Fetch (or reuse) every manifest published for one date.
    async fn sync_date(
        &self,
        date: &str,
        manifests: &mut Vec<(Hash32, Manifest)>,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        let dir = manifest_dir_key(self.scope_id.as_deref(), date);
        for key in self.remote.list(&dir).await? {
            let Some(hash_hex) = key.rsplit('/').next().map(str::to_string) else {
                continue;
            };
            if Hash32::from_hex(&hash_hex).is_err() {
                continue;
            }

            // Already stored locally: parse from the vault, no download.
            if let Some(blob) = self.blob_store.get_local(&hash_hex)? {
                match unpackage_manifest(&blob, self.pinned_pubkey.as_deref()) {
                    Ok(manifest) => {
                        manifests.push((artifact_id_of(&blob)?, manifest));
                    }
                    Err(e) => {
                        outcome.progress.manifest_failures += 1;
                        warn!(key = %key, error = %e, "stored manifest failed verification");
                    }
                }
                continue;
            }

            let Some(blob) = self.remote.get(&key).await? else {
                continue;
            };
            match unpackage_manifest(&blob, self.pinned_pubkey.as_deref()) {
                Ok(manifest) => {
                    let hash = artifact_id_of(&blob)?;
                    // Manifests live in the closet as regular blobs.
                    self.blob_store.put_local(&hash.to_hex(), &blob).await?;
                    outcome.progress.manifests_fetched += 1;
                    outcome.new_manifests.push((hash, manifest.clone()));
                    manifests.push((hash, manifest));
                }
                Err(e) => {
                    outcome.progress.manifest_failures += 1;
                    warn!(key = %key, error = %e, "manifest rejected");
                }
            }
        }
        Ok(())
    }

    /// Download one chunk under the three-phase inflight protocol.
    async fn download_chunk(
        &self,
        hash: Hash32,
        cancel: &CancellationToken,
    ) -> Result<(Hash32, u64)> {
        let hex = hash.to_hex();

        // Phase I: mark inflight.
        {
            let _g = self.lock.acquire().await?;
            self.db.mark_inflight(&hex, now_ms())?;
        }

        // Phase II: fetch and verify, no lock held.
        let fetched = self.fetch_chunk(&hash, cancel).await;

        // Phase III: commit (or clean up) under the lock. The inflight
        // mark is cleared on every path.
        let _g = self.lock.acquire().await?;
        match fetched {
            Ok(bytes) => {
                let result = store_blob_locked(&self.db, &self.vault, &hex, &bytes, now_ms());
                self.db.clear_inflight(&hex)?;
                result?;
                Ok((hash, bytes.len() as u64))
            }
            Err(e) => {
                self.db.clear_inflight(&hex)?;
                Err(e)
            }
        }
    }

    async fn fetch_chunk(&self, hash: &Hash32, cancel: &CancellationToken) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(ClientError::Aborted);
        }
        let bytes = self
            .remote
            .get(&chunk_key(hash))
            .await?
            .ok_or_else(|| ClientError::NotFound(hash.to_hex()))?;
        verify_blob(&bytes, hash).map_err(|e| ClientError::Integrity {
            hash: hash.to_hex(),
            reason: e.to_string(),
        })?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::BlobVault;
    use ingestd::pipeline::{IngestOptions, IngestPipeline};
    use ingestd::sources::FixtureSource;
    use stratus_core::manifest::ManifestSigner;
    use stratus_store::object_store::MemoryStore;
    use tempfile::tempdir;

    struct Fixture {
        engine: SyncEngine,
        db: Arc<ClosetDb>,
        remote: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(scope_id: Option<String>, pinned_pubkey: Option<String>) -> Fixture {
        let dir = tempdir().unwrap();
        let db = Arc::new(ClosetDb::open(dir.path().join("db")).unwrap());
        let vault = Arc::new(BlobVault::open(dir.path().join("vault")).unwrap());
        let remote = Arc::new(MemoryStore::new());
        let lock = ClosetLock::in_process();
        let blob_store = Arc::new(BlobStore::new(
            db.clone(),
            vault.clone(),
            remote.clone(),
            lock.clone(),
        ));
        let engine = SyncEngine::new(
            remote.clone(),
            blob_store,
            db.clone(),
            vault,
            lock,
            scope_id,
            pinned_pubkey,
            SyncOptions::default(),
        );
        Fixture {
            engine,
            db,
            remote,
            _dir: dir,
        }
    }

    async fn publish(
        remote: Arc<MemoryStore>,
        signer: Option<ManifestSigner>,
    ) -> ingestd::pipeline::IngestOutcome {
        let pipeline = IngestPipeline::new(
            remote,
            Arc::new(FixtureSource::new()),
            signer,
            IngestOptions::default(),
        );
        pipeline.run(44.6683, -65.7619, "UTC").await.unwrap()
    }

    #[tokio::test]
    async fn test_sync_empty_cdn_is_empty_progress() {
        let f = fixture(Some("deadbeef".into()), None);
        let outcome = f.engine.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.progress, SyncProgress::default());
    }

    #[tokio::test]
    async fn test_sync_downloads_then_dedupes() {
        let f = fixture(None, None);
        // Publish scoped and mirrored unscoped so the unscoped engine
        // sees it.
        let pipeline = IngestPipeline::new(
            f.remote.clone(),
            Arc::new(FixtureSource::new()),
            None,
            IngestOptions {
                publish_unscoped_mirror: true,
                ..IngestOptions::default()
            },
        );
        pipeline.run(44.6683, -65.7619, "UTC").await.unwrap();

        let first = f.engine.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.progress.manifests_fetched, 1);
        // forecast + station set + observation
        assert_eq!(first.progress.chunks_downloaded, 3);
        assert_eq!(first.progress.chunk_failures, 0);

        // Everything present; the second run downloads nothing.
        let second = f.engine.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.progress.manifests_fetched, 0);
        assert_eq!(second.progress.chunks_downloaded, 0);

        // Inflight drained both times.
        assert!(f.db.inflight().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_sync_with_pinned_key() {
        let signer = ManifestSigner::generate();
        let pubkey = signer.public_key_hex();
        let remote = Arc::new(MemoryStore::new());
        let outcome = publish(remote.clone(), Some(signer)).await;

        let dir = tempdir().unwrap();
        let db = Arc::new(ClosetDb::open(dir.path().join("db")).unwrap());
        let vault = Arc::new(BlobVault::open(dir.path().join("vault")).unwrap());
        let lock = ClosetLock::in_process();
        let blob_store = Arc::new(BlobStore::new(
            db.clone(),
            vault.clone(),
            remote.clone(),
            lock.clone(),
        ));
        let engine = SyncEngine::new(
            remote,
            blob_store,
            db,
            vault,
            lock,
            Some(outcome.scope_id.clone()),
            Some(pubkey),
            SyncOptions::default(),
        );

        let synced = engine.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(synced.progress.manifests_fetched, 1);
        assert_eq!(synced.progress.chunks_downloaded, 3);
        assert_eq!(synced.progress.manifest_failures, 0);
    }

    #[tokio::test]
    async fn test_wrong_signer_counts_manifest_failure() {
        let signer = ManifestSigner::generate();
        let stranger = ManifestSigner::generate();
        let remote = Arc::new(MemoryStore::new());
        let outcome = publish(remote.clone(), Some(signer)).await;

        let f = {
            let dir = tempdir().unwrap();
            let db = Arc::new(ClosetDb::open(dir.path().join("db")).unwrap());
            let vault = Arc::new(BlobVault::open(dir.path().join("vault")).unwrap());
            let lock = ClosetLock::in_process();
            let blob_store = Arc::new(BlobStore::new(
                db.clone(),
                vault.clone(),
                remote.clone(),
                lock.clone(),
            ));
            let engine = SyncEngine::new(
                remote.clone(),
                blob_store,
                db.clone(),
                vault,
                lock,
                Some(outcome.scope_id.clone()),
                Some(stranger.public_key_hex()),
                SyncOptions::default(),
            );
            (engine, db, dir)
        };

        let synced = f.0.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(synced.progress.manifest_failures, 1);
        assert_eq!(synced.progress.manifests_fetched, 0);
        // No entries were trusted, so nothing was downloaded.
        assert_eq!(synced.progress.chunks_downloaded, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let f = fixture(None, None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            f.engine.sync(&cancel).await,
            Err(ClientError::Aborted)
        ));
    }

    #[tokio::test]
    async fn test_missing_chunk_counts_failure() {
        let remote = Arc::new(MemoryStore::new());
        let outcome = publish(remote.clone(), None).await;

        // Remove one chunk from the CDN.
        let victim = outcome.artifact_hashes[0];
        let dir = tempdir().unwrap();
        let db = Arc::new(ClosetDb::open(dir.path().join("db")).unwrap());
        let vault = Arc::new(BlobVault::open(dir.path().join("vault")).unwrap());
        let lock = ClosetLock::in_process();

        // MemoryStore has no delete; rebuild a remote without the victim.
        let pruned = Arc::new(MemoryStore::new());
        for key in remote.list("").await.unwrap() {
            if key != chunk_key(&victim) {
                let bytes = remote.get(&key).await.unwrap().unwrap();
                pruned.put(&key, &bytes).await.unwrap();
            }
        }

        let blob_store = Arc::new(BlobStore::new(
            db.clone(),
            vault.clone(),
            pruned.clone(),
            lock.clone(),
        ));
        let engine = SyncEngine::new(
            pruned,
            blob_store,
            db.clone(),
            vault,
            lock,
            Some(outcome.scope_id.clone()),
            None,
            SyncOptions::default(),
        );

        let synced = engine.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(synced.progress.chunk_failures, 1);
        assert_eq!(synced.progress.chunks_downloaded, 2);
        // The failed hash is not stuck inflight.
        assert!(db.inflight().unwrap().is_empty());
    }
}
