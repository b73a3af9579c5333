use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use crate::error::StoreError;
use crate::store::CoordinationStore;

/// Owner-checked mutex over the coordination store.
///
/// A lock is a key holding the owner token with an expiry. Release and
/// renewal compare the token on the store side, so a holder whose lease
/// expired can never delete or extend a lock that someone else now owns.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Like [`acquire`](Self::acquire) but reports store failures to the caller.
    pub async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.store.set_if_absent(key, owner, ttl).await
    }

    pub async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        match self.try_acquire(key, owner, ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                error!(lock = %key, error = %e, "Failed to acquire lock");
                false
            }
        }
    }

    pub async fn acquire_with_retry(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        attempts: u32,
        backoff: Duration,
    ) -> bool {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            if self.acquire(key, owner, ttl).await {
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
            }
        }
        debug!(lock = %key, attempts, "Lock still held after retries");
        false
    }

    pub async fn release(&self, key: &str, owner: &str) -> bool {
        match self.store.delete_if_equals(key, owner).await {
            Ok(released) => released,
            Err(e) => {
                warn!(lock = %key, error = %e, "Failed to release lock");
                false
            }
        }
    }

    pub async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        match self.store.expire_if_equals(key, owner, ttl).await {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(lock = %key, error = %e, "Failed to renew lock");
                false
            }
        }
    }

    /// Runs `work` while holding the lock and releases it afterwards.
    ///
    /// Returns `None` without running `work` when the lock is held elsewhere.
    pub async fn with_lock<F, T>(&self, key: &str, owner: &str, ttl: Duration, work: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if !self.acquire(key, owner, ttl).await {
            warn!(lock = %key, "Could not acquire lock");
            return None;
        }
        let output = work.await;
        self.release(key, owner).await;
        Some(output)
    }
}
