//! Closet metadata database
//!
//! Persistent typed stores over sled, one tree per store. Values are
//! postcard-encoded records; hashes are normalized to lowercase hex at this
//! boundary so every comparison in the closet happens on one form.
//!
//! Invariants:
//! - a blob counts toward `totalBytesPresent` iff its record has
//!   `present = true`
//! - `lastAccess` is always a valid integer (milliseconds)
//! - an observation-index entry whose blob is not present is legal; it is a
//!   remote-only reference

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::HashSet;
use std::path::Path;
use stratus_core::hash::Hash32;
use thiserror::Error;

/// Current DB schema version. v2 introduced the `inflight` store.
pub const DB_SCHEMA_VERSION: u32 = 2;

/// Compound-key separator (ASCII unit separator; never appears in dates,
/// hashes, models, or canonical variable names).
const SEP: char = '\u{1f}';

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("corrupt record under {0}")]
    Corrupt(String),
}

/// Per-blob metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub size_bytes: u64,
    pub last_access_ms: i64,
    pub pinned: bool,
    pub present: bool,
}

/// One manifest reference under (date, kind, shard).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestRef {
    pub date: String,
    pub kind: String,
    pub shard: String,
    pub hash: Hash32,
}

/// Location of a blob inside a server-composed pack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackLocation {
    pub pack_id: String,
    pub offset: u64,
    pub len: u64,
}

/// Persisted sync-engine state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_synced_date: String,
    pub last_synced_at_ms: i64,
    pub manifests_fetched: u64,
    pub chunks_downloaded: u64,
}

/// The closet database handle.
pub struct ClosetDb {
    db: Db,
    /// hash -> BlobRecord
    blobs: sled::Tree,
    /// (date, kind, shard) -> hash
    manifests: sled::Tree,
    /// (source, bucket, bucketMinutes, stationSetId) -> hash
    obs_index: sled::Tree,
    /// (model, runTime, gridKey) -> hash
    forecast_index: sled::Tree,
    /// hash -> PackLocation
    pack_index: sled::Tree,
    /// hash -> startedAtMs
    inflight: sled::Tree,
    /// key -> value
    meta: sled::Tree,
}

fn norm(hash: &str) -> String {
    hash.to_lowercase()
}

impl ClosetDb {
    /// Open (and upgrade) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let db = sled::open(path)?;
        let this = Self {
            blobs: db.open_tree("blobs")?,
            manifests: db.open_tree("manifests")?,
            obs_index: db.open_tree("obs_index")?,
            forecast_index: db.open_tree("forecast_index")?,
            pack_index: db.open_tree("pack_index")?,
            inflight: db.open_tree("inflight")?,
            meta: db.open_tree("meta")?,
            db,
        };
        this.upgrade()?;
        Ok(this)
    }

    /// Versioned, additive schema upgrades.
    fn upgrade(&self) -> Result<(), DbError> {
        let current = self.schema_version()?;
        if current < 1 {
            // v1: base stores. Trees are created on open; nothing to
            // backfill.
        }
        if current < 2 {
            // v2: the inflight store. Any entries from an older process
            // cannot be trusted, so start clean.
            self.inflight.clear()?;
        }
        if current != DB_SCHEMA_VERSION {
            self.meta
                .insert("schema_version", &DB_SCHEMA_VERSION.to_be_bytes())?;
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<u32, DbError> {
        match self.meta.get("schema_version")? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Corrupt("schema_version".into()))?;
                Ok(u32::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // blobs
    // ------------------------------------------------------------------

    pub fn get_blob(&self, hash: &str) -> Result<Option<BlobRecord>, DbError> {
        match self.blobs.get(norm(hash))? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_blob(&self, hash: &str, record: &BlobRecord) -> Result<(), DbError> {
        self.blobs
            .insert(norm(hash), postcard::to_allocvec(record)?)?;
        Ok(())
    }

    pub fn remove_blob(&self, hash: &str) -> Result<(), DbError> {
        self.blobs.remove(norm(hash))?;
        Ok(())
    }

    /// All blob records, keyed by lowercase hash.
    pub fn blobs(&self) -> Result<Vec<(String, BlobRecord)>, DbError> {
        let mut out = Vec::new();
        for item in self.blobs.iter() {
            let (key, value) = item?;
            let hash = String::from_utf8(key.to_vec())
                .map_err(|_| DbError::Corrupt("blobs key".into()))?;
            out.push((hash, postcard::from_bytes(&value)?));
        }
        Ok(out)
    }

    /// Blob records in the deterministic deletion order:
    /// `(lastAccess ASC, hash ASC)`.
    pub fn blobs_by_access(&self) -> Result<Vec<(String, BlobRecord)>, DbError> {
        let mut out = self.blobs()?;
        out.sort_by(|(ha, ra), (hb, rb)| {
            ra.last_access_ms
                .cmp(&rb.last_access_ms)
                .then_with(|| ha.cmp(hb))
        });
        Ok(out)
    }

    // ------------------------------------------------------------------
    // manifests
    // ------------------------------------------------------------------

    pub fn upsert_manifest_ref(
        &self,
        date: &str,
        kind: &str,
        shard: &str,
        hash: &Hash32,
    ) -> Result<(), DbError> {
        let key = format!("{date}{SEP}{kind}{SEP}{shard}");
        self.manifests.insert(key.as_bytes(), hash.to_hex().as_bytes())?;
        Ok(())
    }

    pub fn manifest_refs(&self) -> Result<Vec<ManifestRef>, DbError> {
        let mut out = Vec::new();
        for item in self.manifests.iter() {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| DbError::Corrupt("manifests key".into()))?;
            let mut parts = key.split(SEP);
            let (Some(date), Some(kind), Some(shard)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(DbError::Corrupt(format!("manifest ref {key}")));
            };
            let hash_hex = std::str::from_utf8(&value)
                .map_err(|_| DbError::Corrupt(format!("manifest ref {key}")))?;
            let hash = Hash32::from_hex(hash_hex)
                .map_err(|_| DbError::Corrupt(format!("manifest ref {key}")))?;
            out.push(ManifestRef {
                date: date.to_string(),
                kind: kind.to_string(),
                shard: shard.to_string(),
                hash,
            });
        }
        Ok(out)
    }

    /// Delete manifest refs dated strictly before `cutoff_ms`, oldest
    /// first, skipping pinned dates. Returns the hashes of the refs that
    /// were removed.
    pub fn prune_manifest_refs_outside_window(
        &self,
        cutoff_ms: i64,
        pinned_dates: &HashSet<String>,
    ) -> Result<Vec<Hash32>, DbError> {
        let mut candidates: Vec<ManifestRef> = self
            .manifest_refs()?
            .into_iter()
            .filter(|r| !pinned_dates.contains(&r.date))
            .filter(|r| match date_start_ms(&r.date) {
                Some(ms) => ms < cutoff_ms,
                // An unparseable date cannot be proven in-window; leave it.
                None => false,
            })
            .collect();
        candidates.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.shard.cmp(&b.shard)));

        let mut touched = Vec::new();
        for r in candidates {
            let key = format!("{}{SEP}{}{SEP}{}", r.date, r.kind, r.shard);
            self.manifests.remove(key.as_bytes())?;
            touched.push(r.hash);
        }
        Ok(touched)
    }

    // ------------------------------------------------------------------
    // observation / forecast indexes
    // ------------------------------------------------------------------

    pub fn upsert_observation_ref(
        &self,
        source: &str,
        bucket: &str,
        bucket_minutes: u32,
        station_set_id: &Hash32,
        hash: &Hash32,
    ) -> Result<(), DbError> {
        let key = format!("{source}{SEP}{bucket}{SEP}{bucket_minutes}{SEP}{station_set_id}");
        self.obs_index.insert(key.as_bytes(), hash.to_hex().as_bytes())?;
        Ok(())
    }

    pub fn observation_ref(
        &self,
        source: &str,
        bucket: &str,
        bucket_minutes: u32,
        station_set_id: &Hash32,
    ) -> Result<Option<Hash32>, DbError> {
        let key = format!("{source}{SEP}{bucket}{SEP}{bucket_minutes}{SEP}{station_set_id}");
        self.read_hash(&self.obs_index, &key)
    }

    pub fn upsert_forecast_ref(
        &self,
        model: &str,
        run_time: &str,
        grid_key: &str,
        hash: &Hash32,
    ) -> Result<(), DbError> {
        let key = format!("{model}{SEP}{run_time}{SEP}{grid_key}");
        self.forecast_index
            .insert(key.as_bytes(), hash.to_hex().as_bytes())?;
        Ok(())
    }

    pub fn forecast_ref(
        &self,
        model: &str,
        run_time: &str,
        grid_key: &str,
    ) -> Result<Option<Hash32>, DbError> {
        let key = format!("{model}{SEP}{run_time}{SEP}{grid_key}");
        self.read_hash(&self.forecast_index, &key)
    }

    fn read_hash(&self, tree: &sled::Tree, key: &str) -> Result<Option<Hash32>, DbError> {
        match tree.get(key.as_bytes())? {
            Some(value) => {
                let hex = std::str::from_utf8(&value)
                    .map_err(|_| DbError::Corrupt(key.to_string()))?;
                Ok(Some(
                    Hash32::from_hex(hex).map_err(|_| DbError::Corrupt(key.to_string()))?,
                ))
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // pack index
    // ------------------------------------------------------------------

    pub fn pack_location(&self, hash: &str) -> Result<Option<PackLocation>, DbError> {
        match self.pack_index.get(norm(hash))? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_pack_location(&self, hash: &str, location: &PackLocation) -> Result<(), DbError> {
        self.pack_index
            .insert(norm(hash), postcard::to_allocvec(location)?)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // inflight
    // ------------------------------------------------------------------

    pub fn mark_inflight(&self, hash: &str, started_at_ms: i64) -> Result<(), DbError> {
        self.inflight
            .insert(norm(hash), &started_at_ms.to_be_bytes())?;
        Ok(())
    }

    pub fn clear_inflight(&self, hash: &str) -> Result<(), DbError> {
        self.inflight.remove(norm(hash))?;
        Ok(())
    }

    pub fn is_inflight(&self, hash: &str) -> Result<bool, DbError> {
        Ok(self.inflight.contains_key(norm(hash))?)
    }

    pub fn inflight(&self) -> Result<Vec<(String, i64)>, DbError> {
        let mut out = Vec::new();
        for item in self.inflight.iter() {
            let (key, value) = item?;
            let hash = String::from_utf8(key.to_vec())
                .map_err(|_| DbError::Corrupt("inflight key".into()))?;
            let raw: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| DbError::Corrupt(format!("inflight {hash}")))?;
            out.push((hash, i64::from_be_bytes(raw)));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // meta
    // ------------------------------------------------------------------

    pub fn get_meta_raw(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.meta.get(key)?.map(|v| v.to_vec()))
    }

    pub fn put_meta_raw(&self, key: &str, value: &[u8]) -> Result<(), DbError> {
        self.meta.insert(key, value)?;
        Ok(())
    }

    pub fn total_bytes_present(&self) -> Result<u64, DbError> {
        match self.meta.get("total_bytes_present")? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Corrupt("total_bytes_present".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    pub fn set_total_bytes_present(&self, value: u64) -> Result<(), DbError> {
        self.meta
            .insert("total_bytes_present", &value.to_be_bytes())?;
        Ok(())
    }

    pub fn add_total_bytes(&self, delta: i64) -> Result<u64, DbError> {
        let updated = (self.total_bytes_present()? as i64 + delta).max(0) as u64;
        self.set_total_bytes_present(updated)?;
        Ok(updated)
    }

    pub fn last_gc_at_ms(&self) -> Result<Option<i64>, DbError> {
        match self.meta.get("last_gc_at_ms")? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Corrupt("last_gc_at_ms".into()))?;
                Ok(Some(i64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    pub fn set_last_gc_at_ms(&self, value: i64) -> Result<(), DbError> {
        self.meta.insert("last_gc_at_ms", &value.to_be_bytes())?;
        Ok(())
    }

    /// Verification receipts short-circuit re-verifying the same
    /// (manifest, public key) pair.
    pub fn has_verification_receipt(&self, hash: &str, pubkey: &str) -> Result<bool, DbError> {
        let key = format!("receipt{SEP}{}{SEP}{}", norm(hash), pubkey.to_lowercase());
        Ok(self.meta.contains_key(key.as_bytes())?)
    }

    pub fn put_verification_receipt(&self, hash: &str, pubkey: &str) -> Result<(), DbError> {
        let key = format!("receipt{SEP}{}{SEP}{}", norm(hash), pubkey.to_lowercase());
        self.meta.insert(key.as_bytes(), &[1u8])?;
        Ok(())
    }

    pub fn sync_state(&self) -> Result<Option<SyncState>, DbError> {
        match self.meta.get("sync_state")? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_sync_state(&self, state: &SyncState) -> Result<(), DbError> {
        self.meta.insert("sync_state", postcard::to_allocvec(state)?)?;
        Ok(())
    }

    /// Drop every store (closet reset). The schema version is rewritten so
    /// the database stays usable.
    pub fn clear_all(&self) -> Result<(), DbError> {
        for tree in [
            &self.blobs,
            &self.manifests,
            &self.obs_index,
            &self.forecast_index,
            &self.pack_index,
            &self.inflight,
            &self.meta,
        ] {
            tree.clear()?;
        }
        self.meta
            .insert("schema_version", &DB_SCHEMA_VERSION.to_be_bytes())?;
        Ok(())
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), DbError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Epoch milliseconds at UTC midnight of a `YYYY-MM-DD` date.
pub fn date_start_ms(date: &str) -> Option<i64> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::hash::hash_bytes;
    use tempfile::tempdir;

    fn open() -> (ClosetDb, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (ClosetDb::open(dir.path()).unwrap(), dir)
    }

    fn record(last_access_ms: i64) -> BlobRecord {
        BlobRecord {
            size_bytes: 100,
            last_access_ms,
            pinned: false,
            present: true,
        }
    }

    #[test]
    fn test_open_sets_schema_version() {
        let (db, _dir) = open();
        assert_eq!(db.schema_version().unwrap(), DB_SCHEMA_VERSION);
    }

    #[test]
    fn test_blob_roundtrip_lowercases_hashes() {
        let (db, _dir) = open();
        let hash = hash_bytes(b"x").to_hex();
        let upper = hash.to_uppercase();

        db.put_blob(&upper, &record(5)).unwrap();
        assert_eq!(db.get_blob(&hash).unwrap().unwrap(), record(5));
        let stored: Vec<String> = db.blobs().unwrap().into_iter().map(|(h, _)| h).collect();
        assert_eq!(stored, vec![hash]);
    }

    #[test]
    fn test_blobs_by_access_order() {
        let (db, _dir) = open();
        db.put_blob(&"dd".repeat(32), &record(50)).unwrap();
        db.put_blob(&"cc".repeat(32), &record(100)).unwrap();
        db.put_blob(&"aa".repeat(32), &record(100)).unwrap();
        db.put_blob(&"bb".repeat(32), &record(100)).unwrap();
        db.put_blob(&"ee".repeat(32), &record(200)).unwrap();

        let order: Vec<String> = db
            .blobs_by_access()
            .unwrap()
            .into_iter()
            .map(|(h, _)| h)
            .collect();
        assert_eq!(
            order,
            vec![
                "dd".repeat(32),
                "aa".repeat(32),
                "bb".repeat(32),
                "cc".repeat(32),
                "ee".repeat(32),
            ]
        );
    }

    #[test]
    fn test_manifest_refs_and_prune() {
        let (db, _dir) = open();
        let h1 = hash_bytes(b"m1");
        let h2 = hash_bytes(b"m2");
        let h3 = hash_bytes(b"m3");
        db.upsert_manifest_ref("2026-01-01", "daily", &h1.to_hex(), &h1)
            .unwrap();
        db.upsert_manifest_ref("2026-01-05", "daily", &h2.to_hex(), &h2)
            .unwrap();
        db.upsert_manifest_ref("2026-01-08", "daily", &h3.to_hex(), &h3)
            .unwrap();

        let cutoff = date_start_ms("2026-01-06").unwrap();
        let mut pinned = HashSet::new();
        pinned.insert("2026-01-01".to_string());

        let touched = db
            .prune_manifest_refs_outside_window(cutoff, &pinned)
            .unwrap();
        // 2026-01-05 pruned; 2026-01-01 pinned; 2026-01-08 in-window.
        assert_eq!(touched, vec![h2]);
        let dates: Vec<String> = db
            .manifest_refs()
            .unwrap()
            .into_iter()
            .map(|r| r.date)
            .collect();
        assert_eq!(dates, vec!["2026-01-01", "2026-01-08"]);
    }

    #[test]
    fn test_indexes() {
        let (db, _dir) = open();
        let set_id = hash_bytes(b"set");
        let obs = hash_bytes(b"obs");
        let fc = hash_bytes(b"fc");

        db.upsert_observation_ref("src", "2026-01-08T19:00:00.000Z", 60, &set_id, &obs)
            .unwrap();
        assert_eq!(
            db.observation_ref("src", "2026-01-08T19:00:00.000Z", 60, &set_id)
                .unwrap(),
            Some(obs)
        );

        db.upsert_forecast_ref("gfs", "2026-01-08T06:00:00.000Z", "pt:1.0000,2.0000", &fc)
            .unwrap();
        assert_eq!(
            db.forecast_ref("gfs", "2026-01-08T06:00:00.000Z", "pt:1.0000,2.0000")
                .unwrap(),
            Some(fc)
        );
    }

    #[test]
    fn test_inflight_lifecycle() {
        let (db, _dir) = open();
        let hash = hash_bytes(b"x").to_hex();
        assert!(!db.is_inflight(&hash).unwrap());

        db.mark_inflight(&hash, 12345).unwrap();
        assert!(db.is_inflight(&hash).unwrap());
        assert_eq!(db.inflight().unwrap(), vec![(hash.clone(), 12345)]);

        db.clear_inflight(&hash).unwrap();
        assert!(!db.is_inflight(&hash).unwrap());
        // Clearing twice is fine.
        db.clear_inflight(&hash).unwrap();
    }

    #[test]
    fn test_total_bytes_accounting() {
        let (db, _dir) = open();
        assert_eq!(db.total_bytes_present().unwrap(), 0);
        db.add_total_bytes(500).unwrap();
        db.add_total_bytes(-200).unwrap();
        assert_eq!(db.total_bytes_present().unwrap(), 300);
        // Never goes negative.
        db.add_total_bytes(-1000).unwrap();
        assert_eq!(db.total_bytes_present().unwrap(), 0);
    }

    #[test]
    fn test_verification_receipts() {
        let (db, _dir) = open();
        let hash = hash_bytes(b"m").to_hex();
        assert!(!db.has_verification_receipt(&hash, "ABCD").unwrap());
        db.put_verification_receipt(&hash, "ABCD").unwrap();
        // Case-insensitive on both components.
        assert!(db
            .has_verification_receipt(&hash.to_uppercase(), "abcd")
            .unwrap());
    }

    #[test]
    fn test_clear_all_retains_schema_version() {
        let (db, _dir) = open();
        db.put_blob(&hash_bytes(b"x").to_hex(), &record(1)).unwrap();
        db.clear_all().unwrap();
        assert!(db.blobs().unwrap().is_empty());
        assert_eq!(db.schema_version().unwrap(), DB_SCHEMA_VERSION);
    }
}
