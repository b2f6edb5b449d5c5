//! Engine configuration
//!
//! Every group has documented defaults and is validated once, when the
//! engine is built. Durations are stored as milliseconds so they can be
//! supplied as plain environment values.

use crate::error::{EngineError, Result};
use crate::models::AnalyzerKind;
use serde::Deserialize;
use std::time::Duration;

/// Environment prefix for configuration keys (`VERDICT_CACHE__TTL_MS=...`)
pub const ENV_PREFIX: &str = "VERDICT";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Instance name used in structured logs
    pub instance_name: String,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    /// Per-analyzer breakers
    pub breaker: BreakerConfig,
    /// Breaker guarding the engine's own critical path
    pub system_breaker: BreakerConfig,
    pub alerts: AlertThresholds,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
    pub ensemble: EnsembleConfig,
    pub request: RequestConfig,
    /// Whether a fast compute backend is available (grows batch lots)
    pub accelerated_backend: bool,
}

impl EngineConfig {
    /// Load configuration from `VERDICT_*` environment variables
    pub fn from_env() -> Result<Self> {
        let source = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        Self::from_source(source)
    }

    /// Load configuration from any `config` source, filling gaps with defaults
    pub fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = config::Config::builder().add_source(source).build()?;
        let mut parsed: EngineConfig = config.try_deserialize()?;
        if parsed.instance_name.is_empty() {
            parsed.instance_name = default_instance_name();
        }
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(EngineError::Config(msg.to_string()));

        if self.cache.max_entries == 0 {
            return fail("cache.max_entries must be greater than 0");
        }
        if self.cache.ttl_ms == 0 {
            return fail("cache.ttl_ms must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.cache.eviction_fraction) || self.cache.eviction_fraction == 0.0 {
            return fail("cache.eviction_fraction must be in (0, 1]");
        }
        if self.batch.min_lot_size == 0 || self.batch.min_lot_size > self.batch.max_lot_size {
            return fail("batch lot size bounds must satisfy 0 < min <= max");
        }
        if self.batch.max_concurrency == 0 {
            return fail("batch.max_concurrency must be greater than 0");
        }
        if self.batch.max_items == 0 {
            return fail("batch.max_items must be greater than 0");
        }
        for breaker in [&self.breaker, &self.system_breaker] {
            if breaker.failure_threshold == 0 {
                return fail("breaker failure_threshold must be greater than 0");
            }
            if breaker.half_open_max_calls == 0 {
                return fail("breaker half_open_max_calls must be greater than 0");
            }
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_ms == 0 {
            return fail("rate_limit window and max_requests must be greater than 0");
        }
        if self.rate_limit.max_tracked_callers == 0 {
            return fail("rate_limit.max_tracked_callers must be greater than 0");
        }
        if self.metrics.window_ms == 0 {
            return fail("metrics.window_ms must be greater than 0");
        }
        if !(0.0..1.0).contains(&self.alerts.hysteresis) {
            return fail("alerts.hysteresis must be in [0, 1)");
        }
        if self.request.max_in_flight == 0 {
            return fail("request.max_in_flight must be greater than 0");
        }
        if self.request.max_analyzers_per_request == 0 {
            return fail("request.max_analyzers_per_request must be greater than 0");
        }
        Ok(())
    }
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "verdict-engine".to_string())
}

/// Prediction cache settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry time-to-live
    pub ttl_ms: u64,
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,
    /// Interval of the background TTL sweep
    pub sweep_interval_ms: u64,
    /// Results below this confidence are not cached
    pub min_confidence: f64,
    /// Share of entries evicted when the cache is full
    pub eviction_fraction: f64,
    /// Maximum nesting depth accepted by key normalization
    pub max_key_depth: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10 * 60 * 1000,
            max_entries: 10_000,
            sweep_interval_ms: 60 * 1000,
            min_confidence: 0.6,
            eviction_fraction: 0.10,
            max_key_depth: 32,
        }
    }
}

/// Batch orchestration settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub min_lot_size: usize,
    pub max_lot_size: usize,
    /// Lot size used when the caller does not suggest one
    pub default_lot_size: usize,
    /// Maximum lots in flight simultaneously
    pub max_concurrency: usize,
    /// Maximum items per batch call
    pub max_items: usize,
    /// Maximum serialized size of a whole batch
    pub max_payload_bytes: usize,
    pub lot_timeout_ms: u64,
    /// Deadline for the whole batch call
    pub batch_timeout_ms: u64,
    /// Per-lot error ratio above which concurrency is reduced
    pub error_rate_threshold: f64,
    /// Pause inserted after shedding concurrency
    pub cooldown_ms: u64,
    /// p95 latency the lot sizing aims for
    pub target_p95_ms: f64,
    /// In-flight operation count considered "under load"
    pub in_flight_high_watermark: usize,
    /// Memory usage ratio considered "high pressure"
    pub memory_pressure_threshold: f64,
}

impl BatchConfig {
    pub fn lot_timeout(&self) -> Duration {
        Duration::from_millis(self.lot_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_lot_size: 4,
            max_lot_size: 128,
            default_lot_size: 32,
            max_concurrency: 4,
            max_items: 1_000,
            max_payload_bytes: 16 * 1024 * 1024,
            lot_timeout_ms: 10_000,
            batch_timeout_ms: 60_000,
            error_rate_threshold: 0.30,
            cooldown_ms: 250,
            target_p95_ms: 500.0,
            in_flight_high_watermark: 64,
            memory_pressure_threshold: 0.80,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before trial calls are allowed
    pub recovery_interval_ms: u64,
    /// Trial calls allowed concurrently while half-open
    pub half_open_max_calls: u32,
}

impl BreakerConfig {
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_interval_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

/// Alert thresholds evaluated against the metrics summary
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Maximum tolerated error rate
    pub error_rate: f64,
    /// Maximum tolerated p95 latency in milliseconds
    pub p95_latency_ms: f64,
    /// Maximum tolerated memory usage ratio
    pub memory_usage: f64,
    /// Minimum acceptable cache hit ratio
    pub cache_hit_ratio: f64,
    /// Relative margin the metric must recross before an alert resolves
    pub hysteresis: f64,
    /// Samples required before rate-based alerts are evaluated
    pub min_samples: u64,
    pub evaluation_interval_ms: u64,
    /// Capacity of the recent-alerts ring
    pub max_recent: usize,
}

impl AlertThresholds {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.05,
            p95_latency_ms: 1_000.0,
            memory_usage: 0.90,
            cache_hit_ratio: 0.20,
            hysteresis: 0.10,
            min_samples: 20,
            evaluation_interval_ms: 30_000,
            max_recent: 100,
        }
    }
}

/// Per-caller rate limiting
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    /// Requests allowed per caller per window
    pub max_requests: u32,
    /// Upper bound on tracked callers; the least recently seen is evicted first
    pub max_tracked_callers: usize,
    pub sweep_interval_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 600,
            max_tracked_callers: 10_000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// Sliding metrics window
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub window_ms: u64,
    /// Trailing window used for throughput
    pub throughput_window_ms: u64,
    /// Hard cap per sample series
    pub max_samples: usize,
}

impl MetricsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_millis(self.throughput_window_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_ms: 10 * 60 * 1000,
            throughput_window_ms: 60 * 1000,
            max_samples: 100_000,
        }
    }
}

/// Ensemble weighting and adjustment constants
///
/// Only the shape of the algorithm is fixed; these values are meant to be
/// recalibrated offline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub weight_pixel: f64,
    pub weight_watermark: f64,
    pub weight_metadata: f64,
    pub weight_provenance: f64,
    pub weight_temporal: f64,
    /// Consensus at or above which confidence is boosted
    pub consensus_high: f64,
    /// Consensus below which confidence is penalized
    pub consensus_low: f64,
    /// Maximum relative boost at consensus 1.0
    pub consensus_boost: f64,
    /// Maximum relative penalty at consensus 0.0
    pub consensus_penalty: f64,
    /// Analyzer count below which evidence is considered thin
    pub min_analyzers: usize,
    /// Relative penalty per missing analyzer
    pub thin_evidence_penalty: f64,
    /// Standard deviations for the confidence outlier check
    pub outlier_std_devs: f64,
    /// Confidence above which a minority vote is flagged
    pub minority_confidence: f64,
    /// Latency multiple of the group mean flagged as slow
    pub slow_latency_factor: f64,
    /// Analyzer count treated as full diversity in the quality score
    pub expected_analyzers: usize,
}

impl EnsembleConfig {
    /// Inherent diagnostic weight of an analyzer kind
    pub fn kind_weight(&self, kind: AnalyzerKind) -> f64 {
        match kind {
            AnalyzerKind::Pixel => self.weight_pixel,
            AnalyzerKind::Watermark => self.weight_watermark,
            AnalyzerKind::Metadata => self.weight_metadata,
            AnalyzerKind::Provenance => self.weight_provenance,
            AnalyzerKind::Temporal => self.weight_temporal,
        }
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            weight_pixel: 1.0,
            weight_watermark: 1.2,
            weight_metadata: 0.8,
            weight_provenance: 1.3,
            weight_temporal: 1.0,
            consensus_high: 0.6,
            consensus_low: 0.4,
            consensus_boost: 0.15,
            consensus_penalty: 0.30,
            min_analyzers: 3,
            thin_evidence_penalty: 0.10,
            outlier_std_devs: 2.0,
            minority_confidence: 0.8,
            slow_latency_factor: 3.0,
            expected_analyzers: 5,
        }
    }
}

/// Per-request limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub analyzer_timeout_ms: u64,
    /// Deadline for analyzer fan-out plus aggregation
    pub request_timeout_ms: u64,
    /// Maximum serialized size of one feature payload
    pub max_payload_bytes: usize,
    /// Maximum nesting depth of one feature payload
    pub max_depth: usize,
    pub max_analyzers_per_request: usize,
    /// Operations accepted concurrently before rejecting
    pub max_in_flight: usize,
}

impl RequestConfig {
    pub fn analyzer_timeout(&self) -> Duration {
        Duration::from_millis(self.analyzer_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            analyzer_timeout_ms: 2_000,
            request_timeout_ms: 5_000,
            max_payload_bytes: 1024 * 1024,
            max_depth: 32,
            max_analyzers_per_request: 8,
            max_in_flight: 1_024,
        }
    }
}
