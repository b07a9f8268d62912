//! Token-bucket rate limiting.
//!
//! One global bucket plus an optional bucket per key (the capability name).
//! A request needs a token from both; neither is consumed if either is empty.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::RateLimiterConfig;

/// Longest single sleep while waiting in [`RateLimiter::acquire`].
const MAX_WAIT_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Rate limit exceeded for '{name}', retry after {}ms", .retry_after.as_millis())]
pub struct RateLimitExceeded {
    pub name: String,
    pub retry_after: Duration,
}

/// A refilling token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `rate` tokens per second, holding at most `burst`. Starts full.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Time until one token is available (zero if one is available now).
    pub fn wait_time(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64((1.0 - self.tokens) / self.rate).unwrap_or(Duration::MAX)
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn take(&mut self) {
        self.tokens -= 1.0;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub accepted: u64,
    pub rejected: u64,
    pub rejection_rate: f64,
    pub tracked_keys: usize,
    pub available_tokens: f64,
}

pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    global: Mutex<TokenBucket>,
    per_key: DashMap<String, TokenBucket>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let global = TokenBucket::new(config.requests_per_second, config.burst_size);
        Self {
            name: name.into(),
            config,
            global: Mutex::new(global),
            per_key: DashMap::new(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Take a token for `key` without waiting.
    pub fn check(&self, key: &str) -> Result<(), RateLimitExceeded> {
        match self.try_take(key) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(retry_after) => Err(self.reject(key, retry_after)),
        }
    }

    /// Wait up to `timeout` for a token for `key`.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<(), RateLimitExceeded> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_take(key) {
                Ok(()) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(wait) => {
                    let now = Instant::now();
                    if wait > deadline.saturating_duration_since(now) {
                        return Err(self.reject(key, wait));
                    }
                    tokio::time::sleep(wait.min(MAX_WAIT_STEP)).await;
                }
            }
        }
    }

    fn try_take(&self, key: &str) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut global = self.global.lock();
        let global_wait = global.wait_time();

        if !self.config.per_key_limit {
            if global_wait.is_zero() {
                global.take();
                return Ok(());
            }
            return Err(global_wait);
        }

        let mut bucket = self.per_key.entry(key.to_string()).or_insert_with(|| {
            TokenBucket::new(
                self.config.per_key_requests_per_second,
                self.config.per_key_burst_size,
            )
        });
        let key_wait = bucket.wait_time();

        if global_wait.is_zero() && key_wait.is_zero() {
            global.take();
            bucket.take();
            Ok(())
        } else {
            Err(global_wait.max(key_wait))
        }
    }

    fn reject(&self, key: &str, retry_after: Duration) -> RateLimitExceeded {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "[RateLimiter] '{}' rejected '{}', retry after {:?}",
            self.name,
            key,
            retry_after
        );
        RateLimitExceeded {
            name: key.to_string(),
            retry_after,
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        RateLimiterStats {
            enabled: self.config.enabled,
            accepted,
            rejected,
            rejection_rate: rejected as f64 / (accepted + rejected).max(1) as f64,
            tracked_keys: self.per_key.len(),
            available_tokens: self.global.lock().available(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("enabled", &self.config.enabled)
            .finish()
    }
}
