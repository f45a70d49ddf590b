//! Local blob vault
//!
//! A content-addressed byte store on disk. `put` recomputes the hash and
//! refuses mismatches before anything touches the filesystem, so vault
//! contents are trustworthy by construction. Deletion is idempotent.

use std::fs;
use std::path::{Path, PathBuf};
use stratus_core::envelope::verify_blob;
use stratus_core::hash::Hash32;
use thiserror::Error;

/// Vault errors
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a blob hash: {0}")]
    InvalidHash(String),
    #[error("rejected blob for {expected}: {reason}")]
    Rejected { expected: String, reason: String },
}

/// Content-addressed file store, sharded by the first hex byte.
pub struct BlobVault {
    root: PathBuf,
}

impl BlobVault {
    /// Open (creating if needed) a vault rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, VaultError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, hash: &str) -> Result<PathBuf, VaultError> {
        let hash = hash.to_lowercase();
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VaultError::InvalidHash(hash));
        }
        Ok(self.root.join(&hash[..2]).join(hash))
    }

    /// Store a blob under its artifact id, verifying the envelope and the
    /// canonical-bytes hash first.
    pub fn put(&self, expected: &str, bytes: &[u8]) -> Result<(), VaultError> {
        let path = self.path_for(expected)?;
        let expected_hash = Hash32::from_hex(&expected.to_lowercase())
            .map_err(|_| VaultError::InvalidHash(expected.to_string()))?;
        verify_blob(bytes, &expected_hash).map_err(|e| VaultError::Rejected {
            expected: expected_hash.to_hex(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp-write");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read a blob, `None` when absent.
    pub fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, VaultError> {
        match fs::read(self.path_for(hash)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Size on disk, `None` when absent.
    pub fn stat(&self, hash: &str) -> Result<Option<u64>, VaultError> {
        match fs::metadata(self.path_for(hash)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a blob. Absent blobs are a no-op.
    pub fn delete(&self, hash: &str) -> Result<(), VaultError> {
        match fs::remove_file(self.path_for(hash)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate every stored hash.
    pub fn all_hashes(&self) -> Result<Vec<String>, VaultError> {
        let mut out = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit()) {
                    out.push(name);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Remove every blob (closet reset).
    pub fn wipe(&self) -> Result<(), VaultError> {
        for hash in self.all_hashes()? {
            self.delete(&hash)?;
        }
        Ok(())
    }
}
