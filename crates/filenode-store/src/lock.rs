//! Distributed mutex over the hot tier
//!
//! A lock is the key `name` holding a random token, written with
//! `set_nx` and an expiry. Release deletes the key only if it still
//! holds our token, so a lock that expired and was taken over by
//! another process is never released by the old owner.
//!
//! Acquisition retries a bounded number of times with a randomized
//! delay; running out of attempts is reported as
//! [`Error::LockNotAcquired`] and left to the caller.

use crate::fast::FastStore;
use bytes::Bytes;
use filenode_common::{Error, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock client configuration
#[derive(Clone, Debug)]
pub struct LockerConfig {
    /// Lock key expiry
    pub expiry: Duration,
    /// Attempts before giving up
    pub tries: u32,
    /// Lower bound of the delay between attempts
    pub min_retry_delay: Duration,
    /// Upper bound of the delay between attempts
    pub max_retry_delay: Duration,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(20 * 60),
            tries: 32,
            min_retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_millis(250),
        }
    }
}

impl From<&filenode_common::config::IndexConfig> for LockerConfig {
    fn from(config: &filenode_common::config::IndexConfig) -> Self {
        Self {
            expiry: config.lock_expiry(),
            tries: config.lock_tries.max(1),
            min_retry_delay: Duration::from_millis(config.lock_min_retry_delay_ms),
            max_retry_delay: Duration::from_millis(
                config
                    .lock_max_retry_delay_ms
                    .max(config.lock_min_retry_delay_ms),
            ),
        }
    }
}

/// Lock client
#[derive(Clone)]
pub struct Locker {
    store: Arc<dyn FastStore>,
    config: LockerConfig,
}

impl Locker {
    pub fn new(store: Arc<dyn FastStore>, config: LockerConfig) -> Self {
        Self { store, config }
    }

    /// Acquire the lock `name`, waiting up to the configured number of attempts.
    pub async fn lock(&self, name: &str) -> Result<LockGuard> {
        let token = Uuid::new_v4().to_string();
        for attempt in 0..self.config.tries {
            if self
                .store
                .set_nx(name, Bytes::from(token.clone()), Some(self.config.expiry))
                .await?
            {
                return Ok(LockGuard {
                    store: Arc::clone(&self.store),
                    name: name.to_string(),
                    token,
                    released: false,
                });
            }
            if attempt + 1 < self.config.tries {
                tokio::time::sleep(self.retry_delay()).await;
            }
        }
        debug!("Lock '{}' still held after {} attempts", name, self.config.tries);
        Err(Error::LockNotAcquired(name.to_string()))
    }

    fn retry_delay(&self) -> Duration {
        let min = self.config.min_retry_delay;
        let max = self.config.max_retry_delay;
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}

/// A held lock. Release it with [`LockGuard::unlock`]; a guard dropped
/// without unlocking (error path, cancelled future) releases in the background.
pub struct LockGuard {
    store: Arc<dyn FastStore>,
    name: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Name of the lock key
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock
    pub async fn unlock(mut self) {
        self.released = true;
        release(&*self.store, &self.name, &self.token).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release(&*store, &name, &token).await });
            }
            Err(_) => warn!("Lock '{}' dropped outside a runtime, left to expire", name),
        }
    }
}

async fn release(store: &dyn FastStore, name: &str, token: &str) {
    match store.del_if_eq(name, token.as_bytes()).await {
        Ok(true) => {}
        Ok(false) => warn!("Lock '{}' expired before release", name),
        Err(e) => warn!("Failed to release lock '{}': {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn locker(store: Arc<MemoryStore>, tries: u32) -> Locker {
        Locker::new(
            store,
            LockerConfig {
                expiry: Duration::from_secs(60),
                tries,
                min_retry_delay: Duration::from_millis(1),
                max_retry_delay: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn test_lock_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let locker = locker(Arc::clone(&store), 3);

        let guard = locker.lock("_lock:g:{a}").await.unwrap();
        assert!(matches!(
            locker.lock("_lock:g:{a}").await,
            Err(Error::LockNotAcquired(_))
        ));

        guard.unlock().await;
        let guard = locker.lock("_lock:g:{a}").await.unwrap();
        assert_eq!(guard.name(), "_lock:g:{a}");
        guard.unlock().await;
        assert!(!store.exists("_lock:g:{a}").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let store = Arc::new(MemoryStore::new());
        let locker = locker(Arc::clone(&store), 50);

        {
            let _guard = locker.lock("_lock:c:x").await.unwrap();
        }
        // The background release races the next attempt; retries cover it
        let guard = locker.lock("_lock:c:x").await.unwrap();
        guard.unlock().await;
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let store = Arc::new(MemoryStore::new());
        let locker = locker(Arc::clone(&store), 200);

        let guard = locker.lock("_lock:s:x").await.unwrap();
        let waiter = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.lock("_lock:s:x").await.map(|g| g.name().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.unlock().await;
        assert_eq!(waiter.await.unwrap().unwrap(), "_lock:s:x");
    }
}
