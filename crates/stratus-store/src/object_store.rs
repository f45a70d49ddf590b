//! Object-store abstraction
//!
//! The capability set is deliberately small: `exists`, overwrite-idempotent
//! `put`, `get`, prefix `list`, and ranged `get_range`. Keys are
//! filesystem-like `/`-separated strings. Pagination is internal to each
//! implementation; `list` always returns the full sorted key set.

use crate::error::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Abstract remote bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Write an object. Overwrites are idempotent.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Read an object, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All keys under a prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read `len` bytes at `offset`. The default implementation slices a
    /// full `get`; remote stores override this with a ranged request.
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let bytes = self.get(key).await?.ok_or_else(|| {
            StoreError::PackFetchInvalid(format!("{key}: object absent"))
        })?;
        let start = usize::try_from(offset)
            .map_err(|_| StoreError::PackFetchInvalid(format!("{key}: offset overflow")))?;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                StoreError::PackFetchInvalid(format!(
                    "{key}: range {offset}+{len} beyond {} bytes",
                    bytes.len()
                ))
            })?;
        Ok(bytes[start..end].to_vec())
    }
}

/// In-memory store for tests and single-process setups.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.objects.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Directory-backed store for self-hosted edges.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let mut path = self.root.clone();
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            path.push(part);
        }
        Ok(path)
    }

    fn collect_keys(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let child_rel = if rel.is_empty() {
                name.to_string()
            } else {
                format!("{rel}/{name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect_keys(&entry.path(), &child_rel, out)?;
            } else {
                out.push(child_rel);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename keeps pointer replacement atomic for readers.
        let tmp = path.with_extension("tmp-write");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if self.root.is_dir() {
            self.collect_keys(&self.root.clone(), "", &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn exercise(store: &dyn ObjectStore) {
        assert!(!store.exists("chunks/aa").await.unwrap());
        store.put("chunks/aa", b"alpha").await.unwrap();
        store.put("chunks/ab", b"beta").await.unwrap();
        store.put("manifests/root.json", b"{}").await.unwrap();

        assert!(store.exists("chunks/aa").await.unwrap());
        assert_eq!(store.get("chunks/aa").await.unwrap().unwrap(), b"alpha");
        assert_eq!(store.get("chunks/zz").await.unwrap(), None);

        // Overwrite is idempotent.
        store.put("chunks/aa", b"alpha").await.unwrap();
        assert_eq!(store.get("chunks/aa").await.unwrap().unwrap(), b"alpha");

        let keys = store.list("chunks/").await.unwrap();
        assert_eq!(keys, vec!["chunks/aa".to_string(), "chunks/ab".to_string()]);

        let range = store.get_range("chunks/aa", 1, 3).await.unwrap();
        assert_eq!(range, b"lph");
        assert!(store.get_range("chunks/aa", 3, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_fs_store() {
        let dir = tempdir().unwrap();
        exercise(&FsStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let dir = tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        assert!(store.get("../outside").await.is_err());
        assert!(store.put("a//b", b"x").await.is_err());
        assert!(store.put("/abs", b"x").await.is_err());
    }
}
