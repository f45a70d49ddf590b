//! Unified client blob store
//!
//! One read path for everything: pack ranges, the local vault, then the
//! remote chunk namespace. Every byte that enters the closet is
//! hash-verified first. Reads deduplicate per hash within the process, and
//! access stamping is buffered with a debounce so hot blobs do not grind
//! the metadata store.

use crate::db::{BlobRecord, ClosetDb};
use crate::error::{ClientError, Result};
use crate::lock::ClosetLock;
use crate::now_ms;
use crate::vault::BlobVault;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stratus_core::envelope::verify_blob;
use stratus_core::hash::Hash32;
use stratus_store::error::StoreError;
use stratus_store::keys::{chunk_key, pack_key};
use stratus_store::object_store::ObjectStore;
use tracing::{debug, warn};

/// Accesses within this window of the stored stamp are dropped.
pub const ACCESS_DEBOUNCE_MS: i64 = 5 * 60 * 1000;

/// Periodic access-buffer flush interval.
pub const ACCESS_FLUSH_INTERVAL: Duration = Duration::from_secs(15);

pub struct BlobStore {
    db: Arc<ClosetDb>,
    vault: Arc<BlobVault>,
    remote: Arc<dyn ObjectStore>,
    lock: ClosetLock,
    /// Per-hash gates deduplicating concurrent fetches.
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Buffered access stamps, folded into the DB by `flush_access`.
    access_buffer: Mutex<HashMap<String, i64>>,
}

impl BlobStore {
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
            gates: Mutex::new(HashMap::new()),
            access_buffer: Mutex::new(HashMap::new()),
        }
    }

    fn gate_for(&self, hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_gate(&self, hash: &str) {
        let mut gates = self.gates.lock();
        if let Some(gate) = gates.get(hash) {
            // Drop the map entry once nobody else holds a clone.
            if Arc::strong_count(gate) == 1 {
                gates.remove(hash);
            }
        }
    }

    /// Fetch a blob by hash: pack range, then vault, then remote chunks.
    pub async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let hash = hash.to_lowercase();
        let parsed = Hash32::from_hex(&hash)
            .map_err(|_| ClientError::InvalidInput(format!("not a blob hash: {hash}")))?;

        let gate = self.gate_for(&hash);
        let _in_flight = gate.lock().await;
        let result = self.get_inner(&hash, &parsed).await;
        drop(_in_flight);
        self.release_gate(&hash);
        result
    }

    async fn get_inner(&self, hash: &str, parsed: &Hash32) -> Result<Vec<u8>> {
        // Pack path: a ranged read from a server-composed pack.
        if let Some(location) = self.db.pack_location(hash)? {
            let bytes = self
                .remote
                .get_range(&pack_key(&location.pack_id), location.offset, location.len)
                .await?;
            if bytes.len() as u64 != location.len {
                return Err(StoreError::PackFetchInvalid(format!(
                    "{hash}: pack slice is {} bytes, index says {}",
                    bytes.len(),
                    location.len
                ))
                .into());
            }
            if let Err(e) = verify_blob(&bytes, parsed) {
                return Err(StoreError::PackFetchInvalid(format!(
                    "{hash}: pack slice failed verification: {e}"
                ))
                .into());
            }
            self.mark_access(hash);
            return Ok(bytes);
        }

        // Local path.
        if let Some(bytes) = self.get_local(hash)? {
            self.mark_access(hash);
            return Ok(bytes);
        }

        // Remote chunk path: verify, persist, account.
        let bytes = self
            .remote
            .get(&chunk_key(parsed))
            .await?
            .ok_or_else(|| ClientError::NotFound(hash.to_string()))?;
        verify_blob(&bytes, parsed).map_err(|e| ClientError::Integrity {
            hash: hash.to_string(),
            reason: e.to_string(),
        })?;

        {
            let _g = self.lock.acquire().await?;
            store_blob_locked(&self.db, &self.vault, hash, &bytes, now_ms())?;
        }
        debug!(hash, bytes = bytes.len(), "blob fetched from remote");
        self.mark_access(hash);
        Ok(bytes)
    }

    /// Read a blob from the vault when its record says it is present.
    /// Never goes remote.
    pub fn get_local(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let hash = hash.to_lowercase();
        match self.db.get_blob(&hash)? {
            Some(record) if record.present => Ok(self.vault.get(&hash)?),
            _ => Ok(None),
        }
    }

    /// Verify and persist locally produced bytes.
    pub async fn put_local(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        let hash = hash.to_lowercase();
        let parsed = Hash32::from_hex(&hash)
            .map_err(|_| ClientError::InvalidInput(format!("not a blob hash: {hash}")))?;
        verify_blob(bytes, &parsed).map_err(|e| ClientError::Integrity {
            hash: hash.clone(),
            reason: e.to_string(),
        })?;
        let _g = self.lock.acquire().await?;
        store_blob_locked(&self.db, &self.vault, &hash, bytes, now_ms())?;
        Ok(())
    }

    /// Buffer an access stamp. Accesses within the debounce window of the
    /// stored stamp are ignored.
    pub fn mark_access(&self, hash: &str) {
        let hash = hash.to_lowercase();
        let now = now_ms();
        if let Ok(Some(record)) = self.db.get_blob(&hash) {
            if now - record.last_access_ms < ACCESS_DEBOUNCE_MS {
                return;
            }
        }
        let mut buffer = self.access_buffer.lock();
        let entry = buffer.entry(hash).or_insert(now);
        *entry = (*entry).max(now);
    }

    /// Fold buffered stamps into the DB under the closet lock, writing
    /// only stamps newer than what is stored. Returns how many records
    /// were updated.
    pub async fn flush_access(&self) -> Result<usize> {
        let drained: Vec<(String, i64)> = {
            let mut buffer = self.access_buffer.lock();
            buffer.drain().collect()
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let _g = self.lock.acquire().await?;
        let mut updated = 0;
        for (hash, stamp) in drained {
            if let Some(mut record) = self.db.get_blob(&hash)? {
                if stamp > record.last_access_ms {
                    record.last_access_ms = stamp;
                    self.db.put_blob(&hash, &record)?;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    /// Spawn the periodic access flusher.
    pub fn spawn_access_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ACCESS_FLUSH_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush_access().await {
                    warn!(error = %e, "access flush failed");
                }
            }
        })
    }
}

/// Persist verified bytes and account for the presence transition. The
/// closet lock must already be held.
pub(crate) fn store_blob_locked(
    db: &ClosetDb,
    vault: &BlobVault,
    hash: &str,
    bytes: &[u8],
    now_ms: i64,
) -> Result<()> {
    vault.put(hash, bytes)?;
    let previous = db.get_blob(hash)?;
    let was_present = previous.as_ref().is_some_and(|r| r.present);
    let record = BlobRecord {
        size_bytes: bytes.len() as u64,
        last_access_ms: now_ms,
        pinned: previous.map(|r| r.pinned).unwrap_or(false),
        present: true,
    };
    db.put_blob(hash, &record)?;
    if !was_present {
        db.add_total_bytes(bytes.len() as i64)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PackLocation;
    use stratus_core::envelope::package_bytes;
    use stratus_core::hash::hash_bytes;
    use stratus_store::object_store::MemoryStore;
    use tempfile::tempdir;

    struct Fixture {
        store: Arc<BlobStore>,
        db: Arc<ClosetDb>,
        remote: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db = Arc::new(ClosetDb::open(dir.path().join("db")).unwrap());
        let vault = Arc::new(BlobVault::open(dir.path().join("vault")).unwrap());
        let remote = Arc::new(MemoryStore::new());
        let store = Arc::new(BlobStore::new(
            db.clone(),
            vault,
            remote.clone(),
            ClosetLock::in_process(),
        ));
        Fixture {
            store,
            db,
            remote,
            _dir: dir,
        }
    }

    fn blob(seed: &[u8]) -> (Hash32, Vec<u8>) {
        let (bytes, id) = package_bytes(seed, 1).unwrap();
        (id, bytes)
    }

    #[tokio::test]
    async fn test_remote_fetch_stores_locally_and_counts_bytes() {
        let f = fixture();
        let (hash, payload) = blob(b"chunk payload");
        f.remote.put(&chunk_key(&hash), &payload).await.unwrap();

        let bytes = f.store.get(&hash.to_hex()).await.unwrap();
        assert_eq!(bytes, payload);

        let record = f.db.get_blob(&hash.to_hex()).unwrap().unwrap();
        assert!(record.present);
        assert_eq!(record.size_bytes, payload.len() as u64);
        assert_eq!(f.db.total_bytes_present().unwrap(), payload.len() as u64);

        // Second read is served locally even if the remote copy rots.
        f.remote.put(&chunk_key(&hash), b"corrupted").await.unwrap();
        let again = f.store.get(&hash.to_hex()).await.unwrap();
        assert_eq!(again, payload);
    }

    #[tokio::test]
    async fn test_corrupt_remote_chunk_rejected() {
        let f = fixture();
        let (hash, _) = blob(b"expected");
        let (_, other_blob) = blob(b"other content");
        // A valid envelope carrying the wrong id.
        f.remote.put(&chunk_key(&hash), &other_blob).await.unwrap();

        assert!(matches!(
            f.store.get(&hash.to_hex()).await,
            Err(ClientError::Integrity { .. })
        ));
        // Raw garbage fails the same way.
        f.remote.put(&chunk_key(&hash), b"garbage").await.unwrap();
        assert!(matches!(
            f.store.get(&hash.to_hex()).await,
            Err(ClientError::Integrity { .. })
        ));
        // Nothing was persisted.
        assert_eq!(f.db.total_bytes_present().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_not_found() {
        let f = fixture();
        let hash = hash_bytes(b"ghost").to_hex();
        assert!(matches!(
            f.store.get(&hash).await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pack_path_verifies_slice() {
        let f = fixture();
        let (hash, payload) = blob(b"packed blob");

        let mut pack = b"prefix-".to_vec();
        let offset = pack.len() as u64;
        pack.extend_from_slice(&payload);
        pack.extend_from_slice(b"-suffix");
        f.remote.put(&pack_key("p1"), &pack).await.unwrap();
        f.db.put_pack_location(
            &hash.to_hex(),
            &PackLocation {
                pack_id: "p1".into(),
                offset,
                len: payload.len() as u64,
            },
        )
        .unwrap();

        assert_eq!(f.store.get(&hash.to_hex()).await.unwrap(), payload);

        // A lying index entry is fatal.
        f.db.put_pack_location(
            &hash.to_hex(),
            &PackLocation {
                pack_id: "p1".into(),
                offset: 0,
                len: payload.len() as u64,
            },
        )
        .unwrap();
        assert!(matches!(
            f.store.get(&hash.to_hex()).await,
            Err(ClientError::Store(StoreError::PackFetchInvalid(_)))
        ));
    }

    #[tokio::test]
    async fn test_put_local_rejects_wrong_hash() {
        let f = fixture();
        let (_, payload) = blob(b"content");
        let wrong = hash_bytes(b"other").to_hex();
        assert!(matches!(
            f.store.put_local(&wrong, &payload).await,
            Err(ClientError::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn test_put_local_counts_first_presence_once() {
        let f = fixture();
        let (hash, payload) = blob(b"local blob");

        f.store.put_local(&hash.to_hex(), &payload).await.unwrap();
        f.store.put_local(&hash.to_hex(), &payload).await.unwrap();
        assert_eq!(f.db.total_bytes_present().unwrap(), payload.len() as u64);
    }

    #[tokio::test]
    async fn test_access_flush_respects_stored_newer_stamp() {
        let f = fixture();
        let (hash, payload) = blob(b"blob");
        let hex = hash.to_hex();
        f.store.put_local(&hex, &payload).await.unwrap();

        // Age the stored stamp so the debounce lets a mark through.
        let mut record = f.db.get_blob(&hex).unwrap().unwrap();
        record.last_access_ms = 1000;
        f.db.put_blob(&hex, &record).unwrap();

        f.store.mark_access(&hex);
        assert_eq!(f.store.flush_access().await.unwrap(), 1);
        let updated = f.db.get_blob(&hex).unwrap().unwrap();
        assert!(updated.last_access_ms > 1000);

        // A fresh stamp within the debounce window is dropped.
        f.store.mark_access(&hex);
        assert_eq!(f.store.flush_access().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_gets_deduplicate() {
        let f = fixture();
        let (hash, payload) = blob(b"shared");
        f.remote.put(&chunk_key(&hash), &payload).await.unwrap();

        let hex = hash.to_hex();
        let (a, b) = tokio::join!(f.store.get(&hex), f.store.get(&hex));
        assert_eq!(a.unwrap(), payload);
        assert_eq!(b.unwrap(), payload);
        assert_eq!(f.db.total_bytes_present().unwrap(), payload.len() as u64);
    }
}
