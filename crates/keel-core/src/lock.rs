//! Per-request mutual exclusion.
//!
//! Every mutating scheduling decision for a request runs while holding that
//! request's lock: the offer matcher takes it through the admission queue, the
//! deploy checker takes it around each deploy evaluation. A lock is released
//! with the timestamp returned at acquisition so the holder's hold time can be
//! measured no matter which task performs the release.
//!
//! # Example
//!
//! ```rust,ignore
//! let lock: Arc<dyn RequestLock> = Arc::new(LocalRequestLock::new());
//! let guard = RequestLockGuard::acquire(lock, "my-request", "deploy-checker").await?;
//! // ... mutate request state ...
//! guard.release().await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::clock::epoch_millis;

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock for request {request_id} unavailable: {reason}")]
    Unavailable { request_id: String, reason: String },

    #[error("lock registry poisoned")]
    Poisoned,
}

/// Named mutual exclusion keyed by request id.
#[async_trait]
pub trait RequestLock: Send + Sync {
    /// Block until the request's lock is held. Returns the acquisition time
    /// in epoch millis.
    async fn lock(&self, request_id: &str, lock_name: &str) -> LockResult<u64>;

    /// Release a lock previously returned by [`RequestLock::lock`].
    async fn unlock(&self, request_id: &str, lock_name: &str, acquired_at: u64);
}

// ── In-process lock ────────────────────────────────────────────────

/// In-process [`RequestLock`] backed by one async mutex per request.
///
/// Held guards are parked in a registry rather than tied to the acquiring
/// task, so a lock taken by one task can be released by another. An unlock
/// only releases the holder whose acquisition time it names.
#[derive(Default)]
pub struct LocalRequestLock {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    held: Mutex<HashMap<String, (u64, OwnedMutexGuard<()>)>>,
}

impl LocalRequestLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if some holder currently owns the request's lock.
    pub fn is_locked(&self, request_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(request_id)
    }

    /// Drop the request's mutex once nobody holds or waits on it. Waiters
    /// clone the mutex under the registry lock, so a count of one here means
    /// the registry owns the only reference.
    fn forget_if_idle(&self, request_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(request_id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(request_id);
        }
    }

    fn mutex_for(&self, request_id: &str) -> LockResult<Arc<AsyncMutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| LockError::Poisoned)?;
        Ok(locks
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }
}

#[async_trait]
impl RequestLock for LocalRequestLock {
    async fn lock(&self, request_id: &str, lock_name: &str) -> LockResult<u64> {
        let mutex = self.mutex_for(request_id)?;
        let wait_start = epoch_millis();
        let guard = mutex.lock_owned().await;
        let acquired_at = epoch_millis();

        self.held
            .lock()
            .map_err(|_| LockError::Poisoned)?
            .insert(request_id.to_string(), (acquired_at, guard));

        debug!(
            %request_id,
            lock_name,
            waited_ms = acquired_at.saturating_sub(wait_start),
            "request lock acquired"
        );
        Ok(acquired_at)
    }

    async fn unlock(&self, request_id: &str, lock_name: &str, acquired_at: u64) {
        let guard = {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            match held.get(request_id) {
                Some((at, _)) if *at == acquired_at => held.remove(request_id),
                Some((at, _)) => {
                    warn!(%request_id, lock_name, acquired_at, held_since = *at, "unlock does not match current holder, ignoring");
                    return;
                }
                None => None,
            }
        };

        let held_ms = epoch_millis().saturating_sub(acquired_at);
        match guard {
            Some(guard) => {
                drop(guard);
                self.forget_if_idle(request_id);
                debug!(%request_id, lock_name, held_ms, "request lock released");
            }
            None => {
                warn!(%request_id, lock_name, held_ms, "unlock of request that was not locked");
            }
        }
    }
}

// ── Scoped guard ───────────────────────────────────────────────────

/// A held request lock carrying its acquisition timestamp.
///
/// Call [`RequestLockGuard::release`] on every normal exit path. If the guard
/// is dropped without release (panic, early return) the unlock is spawned on
/// the current runtime.
pub struct RequestLockGuard {
    lock: Arc<dyn RequestLock>,
    request_id: String,
    lock_name: String,
    acquired_at: u64,
    released: bool,
}

impl RequestLockGuard {
    pub async fn acquire(
        lock: Arc<dyn RequestLock>,
        request_id: &str,
        lock_name: &str,
    ) -> LockResult<Self> {
        let acquired_at = lock.lock(request_id, lock_name).await?;
        Ok(Self {
            lock,
            request_id: request_id.to_string(),
            lock_name: lock_name.to_string(),
            acquired_at,
            released: false,
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn acquired_at(&self) -> u64 {
        self.acquired_at
    }

    pub async fn release(mut self) {
        self.released = true;
        self.lock
            .unlock(&self.request_id, &self.lock_name, self.acquired_at)
            .await;
    }
}

impl std::fmt::Debug for RequestLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLockGuard")
            .field("request_id", &self.request_id)
            .field("lock_name", &self.lock_name)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

impl Drop for RequestLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = self.lock.clone();
        let request_id = std::mem::take(&mut self.request_id);
        let lock_name = std::mem::take(&mut self.lock_name);
        let acquired_at = self.acquired_at;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    lock.unlock(&request_id, &lock_name, acquired_at).await;
                });
            }
            Err(_) => {
                warn!(%request_id, lock_name, "request lock guard dropped outside a runtime, lock leaked");
            }
        }
    }
}

/// Run `f` while holding the request's lock.
pub async fn run_with_request_lock<F, Fut, T>(
    lock: &Arc<dyn RequestLock>,
    request_id: &str,
    lock_name: &str,
    f: F,
) -> LockResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let guard = RequestLockGuard::acquire(lock.clone(), request_id, lock_name).await?;
    let out = f().await;
    guard.release().await;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Records every unlock so tests can check the timestamp passed back.
    #[derive(Default)]
    struct RecordingLock {
        inner: LocalRequestLock,
        unlocks: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl RequestLock for RecordingLock {
        async fn lock(&self, request_id: &str, lock_name: &str) -> LockResult<u64> {
            self.inner.lock(request_id, lock_name).await
        }

        async fn unlock(&self, request_id: &str, lock_name: &str, acquired_at: u64) {
            self.unlocks
                .lock()
                .unwrap()
                .push((request_id.to_string(), acquired_at));
            self.inner.unlock(request_id, lock_name, acquired_at).await;
        }
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_per_request() {
        let lock: Arc<dyn RequestLock> = Arc::new(LocalRequestLock::new());
        let in_section = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let in_section = in_section.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                run_with_request_lock(&lock, "req-a", "test", || async {
                    let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_section.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_requests_do_not_block() {
        let lock = LocalRequestLock::new();
        let a = lock.lock("req-a", "test").await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), lock.lock("req-b", "test"))
            .await
            .expect("second request should not wait")
            .unwrap();
        assert!(lock.is_locked("req-a"));
        assert!(lock.is_locked("req-b"));
        lock.unlock("req-a", "test", a).await;
        lock.unlock("req-b", "test", b).await;
        assert!(!lock.is_locked("req-a"));
    }

    #[tokio::test]
    async fn test_released_requests_leave_no_mutex_behind() {
        let lock = LocalRequestLock::new();
        for n in 0..50 {
            let request_id = format!("req-{n}");
            let at = lock.lock(&request_id, "test").await.unwrap();
            lock.unlock(&request_id, "test", at).await;
        }
        assert!(lock.locks.lock().unwrap().is_empty());
        assert!(lock.held.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutex_kept_while_a_waiter_is_queued() {
        let lock = Arc::new(LocalRequestLock::new());
        let first = lock.lock("req-a", "test").await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.lock("req-a", "test").await.unwrap() })
        };
        // Let the waiter register on the mutex.
        while Arc::strong_count(&lock.mutex_for("req-a").unwrap()) < 4 {
            tokio::task::yield_now().await;
        }

        lock.unlock("req-a", "test", first).await;
        assert_eq!(lock.locks.lock().unwrap().len(), 1);

        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should get the lock")
            .unwrap();
        assert!(lock.is_locked("req-a"));
        lock.unlock("req-a", "test", second).await;
        assert!(lock.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlock_with_foreign_timestamp_keeps_holder() {
        let lock = LocalRequestLock::new();
        let at = lock.lock("req-a", "test").await.unwrap();
        lock.unlock("req-a", "test", at + 1).await;
        assert!(lock.is_locked("req-a"));
        lock.unlock("req-a", "test", at).await;
        assert!(!lock.is_locked("req-a"));
    }

    #[tokio::test]
    async fn test_release_from_another_task_uses_acquired_at() {
        let recording = Arc::new(RecordingLock::default());
        let lock: Arc<dyn RequestLock> = recording.clone();

        let guard = RequestLockGuard::acquire(lock.clone(), "req-a", "test")
            .await
            .unwrap();
        let acquired_at = guard.acquired_at();

        tokio::spawn(async move { guard.release().await })
            .await
            .unwrap();

        assert!(!recording.inner.is_locked("req-a"));
        let unlocks = recording.unlocks.lock().unwrap().clone();
        assert_eq!(unlocks, vec![("req-a".to_string(), acquired_at)]);
    }

    #[tokio::test]
    async fn test_dropped_guard_still_unlocks() {
        let recording = Arc::new(RecordingLock::default());
        let lock: Arc<dyn RequestLock> = recording.clone();
        {
            let _guard = RequestLockGuard::acquire(lock.clone(), "req-a", "test")
                .await
                .unwrap();
        }
        // The drop path spawns the unlock; wait until it lands.
        let relocked = tokio::time::timeout(Duration::from_secs(1), lock.lock("req-a", "test"))
            .await
            .expect("dropped guard should release the lock")
            .unwrap();
        lock.unlock("req-a", "test", relocked).await;
        assert_eq!(recording.unlocks.lock().unwrap().len(), 2);
    }
}
