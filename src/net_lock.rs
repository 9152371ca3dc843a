//! Named locks shared between bots
//!
//! A holder gets a token from [`NetLocks::get_net_lock`] and must present it
//! to [`NetLocks::del_net_lock`]. Releasing with a stale token is ignored.
//! Clones share the same key space.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::errors::{ErrKind, Result, TradeError};

pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default)]
struct Inner {
    held: Mutex<HashMap<String, u32>>,
    released: Notify,
    next_token: AtomicU32,
}

#[derive(Debug, Clone, Default)]
pub struct NetLocks {
    inner: Arc<Inner>,
}

impl NetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, waiting up to `timeout_secs` (0 means 30).
    pub async fn get_net_lock(&self, key: &str, timeout_secs: u64) -> Result<u32> {
        let secs = if timeout_secs == 0 { DEFAULT_LOCK_TIMEOUT_SECS } else { timeout_secs };
        let deadline = Instant::now() + Duration::from_secs(secs);
        let lock_key = format!("lock_{}", key);
        loop {
            // register interest before checking, so a release in between is not missed
            let released = self.inner.released.notified();
            {
                let mut held = self.inner.held.lock().await;
                if !held.contains_key(&lock_key) {
                    let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
                    held.insert(lock_key, token);
                    debug!(key, token, "net lock taken");
                    return Ok(token);
                }
            }
            if timeout_at(deadline, released).await.is_err() {
                return Err(TradeError::new(ErrKind::Timeout, format!("get_net_lock for {}", key)));
            }
        }
    }

    /// Release `key` if `token` still holds it. Returns whether it was released.
    pub async fn del_net_lock(&self, key: &str, token: u32) -> bool {
        let lock_key = format!("lock_{}", key);
        let mut held = self.inner.held.lock().await;
        match held.get(&lock_key) {
            Some(cur) if *cur == token => {
                held.remove(&lock_key);
                drop(held);
                self.inner.released.notify_waiters();
                true
            }
            cur => {
                info!(key, ?cur, token, "del lock fail");
                false
            }
        }
    }

    pub async fn is_locked(&self, key: &str) -> bool {
        self.inner.held.lock().await.contains_key(&format!("lock_{}", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let locks = NetLocks::new();
        let token = locks.get_net_lock("pair", 1).await.unwrap();
        assert!(locks.is_locked("pair").await);

        let other = locks.clone();
        let waiter = tokio::spawn(async move { other.get_net_lock("pair", 5).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        assert!(!locks.del_net_lock("pair", token + 100).await);
        assert!(locks.del_net_lock("pair", token).await);
        let second = waiter.await.unwrap().unwrap();
        assert_ne!(second, token);
    }

    #[tokio::test]
    async fn test_lock_times_out() {
        let locks = NetLocks::new();
        locks.get_net_lock("k", 1).await.unwrap();
        let err = locks.get_net_lock("k", 1).await.unwrap_err();
        assert!(err.is(ErrKind::Timeout));
        // other keys are independent
        locks.get_net_lock("other", 1).await.unwrap();
    }
}
