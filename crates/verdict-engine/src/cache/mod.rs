//! Prediction cache
//!
//! Content-addressed store of ensemble results with TTL expiry and LRU
//! eviction under a size cap. Expiry is enforced lazily on `get` and by a
//! periodic background sweep, so cold entries do not outlive their TTL.

pub mod key;

pub use key::{cache_key, canonicalize, CacheKeyError, FLOAT_PRECISION};

use crate::config::CacheConfig;
use crate::models::{EnsembleResult, FeaturePayload};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Cache activity reported to an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Hit,
    Miss,
    Eviction,
    Expiration,
}

impl CacheEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEvent::Hit => "hit",
            CacheEvent::Miss => "miss",
            CacheEvent::Eviction => "eviction",
            CacheEvent::Expiration => "expiration",
        }
    }
}

/// Receiver of cache activity (the metrics manager in production)
pub trait CacheEventSink: Send + Sync {
    fn on_cache_event(&self, event: CacheEvent);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: EnsembleResult,
    created_at: Instant,
    last_access_at: Instant,
    hit_count: u64,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_ratio: f64,
}

/// TTL + LRU cache of ensemble results keyed by normalized features
pub struct PredictionCache {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    sink: Option<Arc<dyn CacheEventSink>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl PredictionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(config.max_entries.min(1024))),
            config,
            sink: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Report every hit, miss, eviction and expiration to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn CacheEventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Derive the cache key for a payload
    pub fn key_for(&self, features: &FeaturePayload) -> Result<String, CacheKeyError> {
        cache_key(features, self.config.max_key_depth)
    }

    /// Look up a previous result for the same normalized features
    pub fn get(&self, features: &FeaturePayload) -> Result<Option<EnsembleResult>, CacheKeyError> {
        let key = self.key_for(features)?;
        Ok(self.get_by_key(&key))
    }

    /// Look up by a precomputed key
    pub fn get_by_key(&self, key: &str) -> Option<EnsembleResult> {
        let now = Instant::now();
        let ttl = self.config.ttl();

        let outcome = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) if now.duration_since(entry.created_at) >= ttl => {
                    entries.remove(key);
                    Err(true)
                }
                Some(entry) => {
                    entry.last_access_at = now;
                    entry.hit_count += 1;
                    let mut result = entry.result.clone();
                    result.cache_hit = true;
                    Ok(result)
                }
                None => Err(false),
            }
        };

        match outcome {
            Ok(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.emit(CacheEvent::Hit);
                Some(result)
            }
            Err(expired) => {
                if expired {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    self.emit(CacheEvent::Expiration);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.emit(CacheEvent::Miss);
                None
            }
        }
    }

    /// Store a result for the given features
    pub fn put(&self, features: &FeaturePayload, result: &EnsembleResult) -> Result<(), CacheKeyError> {
        let key = self.key_for(features)?;
        self.put_by_key(key, result);
        Ok(())
    }

    /// Store by a precomputed key. The first live writer wins a race.
    pub fn put_by_key(&self, key: String, result: &EnsembleResult) {
        let now = Instant::now();
        let ttl = self.config.ttl();

        let evicted = {
            let mut entries = self.entries.lock();
            if let Some(existing) = entries.get(&key) {
                if now.duration_since(existing.created_at) < ttl {
                    return;
                }
            }

            let evicted = if entries.len() >= self.config.max_entries && !entries.contains_key(&key) {
                self.evict_lru(&mut entries)
            } else {
                0
            };

            let mut stored = result.clone();
            stored.cache_hit = false;
            entries.insert(
                key,
                CacheEntry {
                    result: stored,
                    created_at: now,
                    last_access_at: now,
                    hit_count: 0,
                },
            );
            evicted
        };

        if evicted > 0 {
            debug!(evicted, "Evicted least recently used cache entries");
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            for _ in 0..evicted {
                self.emit(CacheEvent::Eviction);
            }
        }
    }

    /// Drop the least recently used share of entries, returns how many went
    fn evict_lru(&self, entries: &mut HashMap<String, CacheEntry>) -> usize {
        let target = ((entries.len() as f64 * self.config.eviction_fraction).ceil() as usize)
            .max(1)
            .min(entries.len());

        let mut by_access: Vec<(Instant, String)> = entries
            .iter()
            .map(|(k, e)| (e.last_access_at, k.clone()))
            .collect();
        by_access.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, key) in by_access.into_iter().take(target) {
            entries.remove(&key);
        }
        target
    }

    /// Remove every entry older than the TTL, returns how many went
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl();
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, e| now.duration_since(e.created_at) < ttl);
            before - entries.len()
        };
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            for _ in 0..removed {
                self.emit(CacheEvent::Expiration);
            }
        }
        removed
    }

    /// Remove entries whose result matches `predicate`
    pub fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&EnsembleResult) -> bool,
    {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !predicate(&e.result));
        before - entries.len()
    }

    /// Remove every entry
    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Times a cached entry has been served
    pub fn hit_count(&self, key: &str) -> Option<u64> {
        self.entries.lock().get(key).map(|e| e.hit_count)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.len(),
            capacity: self.config.max_entries,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_ratio: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }

    /// Periodically purge expired entries until shutdown
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.sweep_interval_ms,
            "Starting cache expiry sweeper"
        );

        let mut ticker = interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.purge_expired();
                    if removed > 0 {
                        debug!(removed, remaining = self.len(), "Cache sweep purged expired entries");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down cache expiry sweeper");
                    break;
                }
            }
        }
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(sink) = &self.sink {
            sink.on_cache_event(event);
        }
    }
}
