//! Per-caller rate limiting
//!
//! One token bucket per caller identity: each caller may spend
//! `max_requests` tokens per window, refilled continuously. Callers idle for
//! a full window are forgotten by a periodic sweep, and the number of
//! tracked callers never exceeds `max_tracked_callers`: once full, the least
//! recently seen caller is evicted to make room.

use crate::config::RateLimitConfig;
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

/// Caller identity used when a request carries none
pub const ANONYMOUS_CALLER: &str = "anonymous";

#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitStats {
    pub allowed: u64,
    pub denied: u64,
    pub evicted: u64,
    pub tracked_callers: usize,
}

struct CallerBucket {
    limiter: DefaultDirectRateLimiter,
    last_seen: Mutex<Instant>,
}

impl CallerBucket {
    fn new(quota: Quota) -> Self {
        Self {
            limiter: RateLimiter::direct(quota),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

pub struct CallerRateLimiter {
    config: RateLimitConfig,
    quota: Quota,
    buckets: DashMap<String, Arc<CallerBucket>>,
    clock: DefaultClock,
    allowed: AtomicU64,
    denied: AtomicU64,
    evicted: AtomicU64,
}

impl CallerRateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        let burst = NonZeroU32::new(config.max_requests)
            .ok_or_else(|| EngineError::Config("rate_limit.max_requests must be > 0".to_string()))?;
        if config.max_tracked_callers == 0 {
            return Err(EngineError::Config(
                "rate_limit.max_tracked_callers must be > 0".to_string(),
            ));
        }
        let period = config.window() / config.max_requests;
        let quota = Quota::with_period(period)
            .ok_or_else(|| EngineError::Config("rate_limit window too small for max_requests".to_string()))?
            .allow_burst(burst);

        Ok(Self {
            quota,
            buckets: DashMap::new(),
            clock: DefaultClock::default(),
            config,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        })
    }

    /// Spend one token for `caller`
    pub fn check(&self, caller: &str) -> Result<()> {
        let bucket = self.bucket(caller);
        *bucket.last_seen.lock() = Instant::now();
        match bucket.limiter.check() {
            Ok(()) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(not_until) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                let retry_after = not_until.wait_time_from(self.clock.now());
                debug!(caller, retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
                Err(EngineError::RateLimited {
                    caller: caller.to_string(),
                    limit: self.config.max_requests,
                    window: self.config.window(),
                    retry_after,
                })
            }
        }
    }

    fn bucket(&self, caller: &str) -> Arc<CallerBucket> {
        if let Some(bucket) = self.buckets.get(caller) {
            return Arc::clone(bucket.value());
        }

        let cap = self.config.max_tracked_callers;
        if self.buckets.len() >= cap {
            self.sweep();
            while self.buckets.len() >= cap {
                if !self.evict_oldest() {
                    break;
                }
            }
        }

        let entry = self
            .buckets
            .entry(caller.to_string())
            .or_insert_with(|| Arc::new(CallerBucket::new(self.quota)));
        Arc::clone(entry.value())
    }

    fn evict_oldest(&self) -> bool {
        let oldest = self
            .buckets
            .iter()
            .max_by_key(|entry| entry.value().idle_for())
            .map(|entry| entry.key().clone());
        match oldest {
            Some(caller) => {
                self.buckets.remove(&caller);
                self.evicted.fetch_add(1, Ordering::Relaxed);
                debug!(caller = %caller, "Rate-limit bucket evicted at capacity");
                true
            }
            None => false,
        }
    }

    /// Forget callers idle for a whole window; their buckets are full again
    pub fn sweep(&self) -> usize {
        let window = self.config.window();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.idle_for() < window);
        before.saturating_sub(self.buckets.len())
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            tracked_callers: self.buckets.len(),
        }
    }

    /// Periodic sweep until shutdown
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.sweep_interval().max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let forgotten = self.sweep();
                    if forgotten > 0 {
                        debug!(forgotten, "Idle rate-limit buckets dropped");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Rate limiter sweeper shutting down");
                    break;
                }
            }
        }
    }
}
