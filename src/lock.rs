//! Per-slot operation locks.
//!
//! Lifecycle operations (attach, switch, cancel) serialize per slot: only one
//! may run against a given customer/group/entity at a time. Locks carry a TTL
//! so a crashed holder cannot wedge the slot forever, and release on every
//! exit path, including early errors, via the guard's drop.

use crate::customer::SlotKey;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Default lock lifetime. Generous against slow provider calls, short enough
/// that an abandoned lock clears within a minute.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Mutual exclusion port for slot-scoped operations.
#[async_trait]
pub trait SlotLock: Send + Sync {
    /// Try to take the lock. Returns a holder token, or `None` if the slot is
    /// currently held by a live (non-expired) holder.
    async fn try_acquire(&self, key: &SlotKey, ttl: Duration) -> Result<Option<u64>>;

    /// Release a held lock. A stale token (expired and re-acquired by someone
    /// else) is a no-op.
    async fn release(&self, key: &SlotKey, token: u64) -> Result<()>;
}

/// RAII handle for a held slot lock.
///
/// Call [`SlotGuard::release`] on the happy path; if the guard is dropped
/// without it (early `?` return, panic unwind), the release is spawned in the
/// background and the TTL bounds the worst case.
#[derive(Debug)]
pub struct SlotGuard<L: SlotLock + Clone + Send + 'static> {
    lock: L,
    key: SlotKey,
    token: u64,
    released: bool,
}

impl<L: SlotLock + Clone + Send + 'static> SlotGuard<L> {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release(&self.key, self.token).await
    }
}

impl<L: SlotLock + Clone + Send + 'static> Drop for SlotGuard<L> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = self.lock.clone();
        let key = self.key.clone();
        let token = self.token;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = lock.release(&key, token).await {
                    warn!(target: "tollgate::lock", key = %key, %err, "background lock release failed");
                }
            });
        }
    }
}

/// Acquire the slot lock or fail fast with `Conflict`.
///
/// Callers retry at their own pace; the engine never queues behind another
/// operation on the same slot.
pub async fn acquire_slot<L>(lock: &L, key: &SlotKey, ttl: Duration) -> Result<SlotGuard<L>>
where
    L: SlotLock + Clone + Send + 'static,
{
    match lock.try_acquire(key, ttl).await? {
        Some(token) => Ok(SlotGuard {
            lock: lock.clone(),
            key: key.clone(),
            token,
            released: false,
        }),
        None => Err(EngineError::Conflict(format!(
            "another operation is in progress for {key}"
        ))),
    }
}

/// Process-local lock table. Suitable for single-instance deployments and
/// tests; multi-instance deployments supply a shared implementation.
#[derive(Debug, Clone, Default)]
pub struct InMemorySlotLock {
    inner: std::sync::Arc<std::sync::Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    held: std::collections::HashMap<SlotKey, (u64, std::time::Instant)>,
    next_token: u64,
}

impl InMemorySlotLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotLock for InMemorySlotLock {
    async fn try_acquire(&self, key: &SlotKey, ttl: Duration) -> Result<Option<u64>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Internal("lock table poisoned".to_string()))?;
        let now = std::time::Instant::now();
        if let Some((_, expires)) = inner.held.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }
        inner.next_token += 1;
        let token = inner.next_token;
        inner.held.insert(key.clone(), (token, now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, key: &SlotKey, token: u64) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Internal("lock table poisoned".to_string()))?;
        if inner.held.get(key).is_some_and(|(t, _)| *t == token) {
            inner.held.remove(key);
        }
        Ok(())
    }
}
