//! Token bucket limiting exchange calls made by the live order worker

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};

use crate::errors::{ErrKind, Result, TradeError};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Calls allowed per refill interval
    pub max_calls: usize,
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_calls: 10,
            refill_interval: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_rate(mut self, calls: usize) -> Self {
        self.max_calls = calls.max(1);
        self
    }

    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }
}

/// Clones share one bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    max_permits: usize,
    last_refill: Arc<Mutex<Instant>>,
    refill_interval: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_calls)),
            max_permits: config.max_calls,
            last_refill: Arc::new(Mutex::new(Instant::now())),
            refill_interval: config.refill_interval,
        }
    }

    pub fn with_rate(calls: usize) -> Self {
        Self::new(RateLimiterConfig::default().with_rate(calls))
    }

    /// Wait until a call may be made and consume its permit.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            self.try_refill().await;
            match self.permits.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    return Ok(());
                }
                Err(tokio::sync::TryAcquireError::Closed) => {
                    return Err(TradeError::new(ErrKind::RunTime, "rate limiter closed"));
                }
                Err(tokio::sync::TryAcquireError::NoPermits) => {
                    sleep(self.refill_interval / 4).await;
                }
            }
        }
    }

    pub async fn try_acquire(&self) -> bool {
        self.try_refill().await;
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn try_refill(&self) {
        let mut last = self.last_refill.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.refill_interval {
            return;
        }
        let intervals = (elapsed.as_millis() / self.refill_interval.as_millis().max(1)) as usize;
        let current = self.permits.available_permits();
        let to_add = (intervals * self.max_permits).min(self.max_permits.saturating_sub(current));
        if to_add > 0 {
            self.permits.add_permits(to_add);
        }
        *last = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exhaust_then_refill() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::default()
                .with_rate(2)
                .with_refill_interval(Duration::from_millis(40)),
        );
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert_eq!(limiter.available_permits(), 0);
        assert!(!limiter.try_acquire().await);
        // blocks until the next refill instead of forever
        tokio::time::timeout(Duration::from_secs(2), limiter.acquire())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_bucket() {
        let a = RateLimiter::new(
            RateLimiterConfig::default()
                .with_rate(3)
                .with_refill_interval(Duration::from_secs(60)),
        );
        let b = a.clone();
        a.acquire().await.unwrap();
        assert_eq!(b.available_permits(), 2);
    }
}
