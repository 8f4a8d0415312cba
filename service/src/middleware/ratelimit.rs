//! Token-bucket rate limiting per scope.
//!
//! Buckets refill lazily on access; there is no background timer.  Each
//! bucket has its own mutex so unrelated scopes never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::secs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Burst size, and the number of requests allowed per window.
    pub capacity: u32,
    /// Time for an empty bucket to refill completely.  Zero disables refill.
    #[serde(with = "secs")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 3,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Tokens added per second.
    pub fn refill_per_sec(&self) -> f64 {
        if self.window.is_zero() {
            0.0
        } else {
            f64::from(self.capacity) / self.window.as_secs_f64()
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Per-scope token buckets.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let capacity = f64::from(self.config.capacity);
        let now = self.clock.now();
        Arc::clone(buckets.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: now,
            }))
        }))
    }

    /// Take one token.  On failure, returns how long until one is available
    /// (`None` when the bucket never refills).
    pub fn try_acquire(&self, key: &str) -> Result<(), Option<Duration>> {
        if !self.config.enabled {
            return Ok(());
        }
        let capacity = f64::from(self.config.capacity);
        let rate = self.config.refill_per_sec();
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.refill(self.clock.now(), capacity, rate);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        if rate > 0.0 {
            Err(Duration::try_from_secs_f64((1.0 - bucket.tokens) / rate).ok())
        } else {
            Err(None)
        }
    }

    /// Return a token taken by [`RateLimiter::try_acquire`].
    pub fn release(&self, key: &str) {
        if !self.config.enabled {
            return;
        }
        let capacity = f64::from(self.config.capacity);
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.tokens = (bucket.tokens + 1.0).min(capacity);
    }

    /// Whole tokens currently available to `key`.
    pub fn available(&self, key: &str) -> u32 {
        if !self.config.enabled {
            return u32::MAX;
        }
        let capacity = f64::from(self.config.capacity);
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.refill(self.clock.now(), capacity, self.config.refill_per_sec());
        bucket.tokens.floor() as u32
    }
}
