//! Closet mutex
//!
//! A single named exclusive lock serializes every closet-mutating section:
//! GC phases, reconciliation, reclaim, sync commit phases, maintenance, and
//! the access-buffer flush. The provider seam lets tests install a strict
//! implementation that errors on any overlapping acquisition instead of
//! waiting, proving mutual exclusion.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

/// Name of the closet's single coordination lock.
pub const CLOSET_MUTEX: &str = "closet:mutex";

/// Default acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock errors
#[derive(Debug, Error)]
pub enum LockError {
    /// The timeout elapsed before the lock was granted. Timeouts surface
    /// as errors, never as silent skips.
    #[error("timed out acquiring lock {0}")]
    Timeout(String),
    /// A strict provider observed an overlapping acquisition.
    #[error("overlapping acquisition of lock {0}")]
    Contended(String),
}

/// Held lock. Releases on drop, on every exit path.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Coordination primitive seam.
#[async_trait]
pub trait LockProvider: Send + Sync {
    async fn acquire(&self, name: &str, timeout: Option<Duration>)
        -> Result<LockGuard, LockError>;
}

/// Process-local provider: one tokio mutex per name.
#[derive(Default)]
pub struct ProcessLockProvider {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProcessLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl LockProvider for ProcessLockProvider {
    async fn acquire(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        let mutex = self.mutex_for(name);
        let guard = match timeout {
            Some(limit) => tokio::time::timeout(limit, mutex.lock_owned())
                .await
                .map_err(|_| LockError::Timeout(name.to_string()))?,
            None => mutex.lock_owned().await,
        };
        Ok(LockGuard { _guard: guard })
    }
}

/// Strict provider: trips immediately when an acquisition overlaps an
/// outstanding one instead of queueing. Test-only discipline check.
#[derive(Default)]
pub struct StrictLockProvider {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StrictLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockProvider for StrictLockProvider {
    async fn acquire(
        &self,
        name: &str,
        _timeout: Option<Duration>,
    ) -> Result<LockGuard, LockError> {
        let mutex = self
            .locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = mutex
            .try_lock_owned()
            .map_err(|_| LockError::Contended(name.to_string()))?;
        Ok(LockGuard { _guard: guard })
    }
}

/// Handle to the closet's named lock.
#[derive(Clone)]
pub struct ClosetLock {
    provider: Arc<dyn LockProvider>,
}

impl ClosetLock {
    pub fn new(provider: Arc<dyn LockProvider>) -> Self {
        Self { provider }
    }

    /// Process-local default.
    pub fn in_process() -> Self {
        Self::new(Arc::new(ProcessLockProvider::new()))
    }

    /// Acquire with the default timeout.
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        self.provider
            .acquire(CLOSET_MUTEX, Some(DEFAULT_LOCK_TIMEOUT))
            .await
    }

    /// Acquire with an explicit timeout.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        self.provider.acquire(CLOSET_MUTEX, Some(timeout)).await
    }
}
