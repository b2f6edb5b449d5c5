//! Sliding-window metrics
//!
//! Keeps timestamped samples of prediction latencies, error events, cache
//! events and analyzer connectivity for a rolling window, and summarizes
//! them on demand. A periodic evaluation pass turns the summary into alerts.

pub mod alerts;
mod window;

pub use alerts::{Alert, AlertChange, AlertEvaluator, AlertKind, AlertSeverity};
pub use window::{Percentiles, SampleWindow};

use crate::cache::{CacheEvent, CacheEventSink};
use crate::config::{AlertThresholds, MetricsConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Eviction pressure at which cache effectiveness is halved
const EVICTION_PENALTY: f64 = 0.5;

/// Cache figures over the window
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheEffectiveness {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_ratio: f64,
    /// Evictions per lookup
    pub eviction_rate: f64,
    /// Hit ratio discounted by eviction churn, in [0, 1]
    pub effectiveness: f64,
}

/// Read-only snapshot of the metrics window
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub window_ms: u64,
    /// Successful predictions in the window
    pub predictions: u64,
    /// Predictions plus failed requests in the window
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub latency: Percentiles,
    /// Predictions per second over the trailing throughput window
    pub throughput: f64,
    pub cache: CacheEffectiveness,
    pub analyzers_connected: usize,
    pub analyzers_total: usize,
    pub connectivity_ratio: f64,
    pub memory_usage: Option<f64>,
    pub active_alerts: Vec<Alert>,
    pub total_predictions: u64,
    pub total_errors: u64,
}

struct Series {
    latencies: SampleWindow<f64>,
    errors: SampleWindow<&'static str>,
    cache: SampleWindow<CacheEvent>,
    connectivity: HashMap<String, bool>,
    memory_usage: Option<f64>,
}

pub struct MetricsManager {
    config: MetricsConfig,
    series: Mutex<Series>,
    alerts: Mutex<AlertEvaluator>,
    total_predictions: AtomicU64,
    total_errors: AtomicU64,
}

impl MetricsManager {
    pub fn new(config: MetricsConfig, thresholds: AlertThresholds) -> Self {
        let window = config.window();
        let cap = config.max_samples;
        Self {
            series: Mutex::new(Series {
                latencies: SampleWindow::new(window, cap),
                errors: SampleWindow::new(window, cap),
                cache: SampleWindow::new(window, cap),
                connectivity: HashMap::new(),
                memory_usage: None,
            }),
            alerts: Mutex::new(AlertEvaluator::new(thresholds)),
            config,
            total_predictions: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    /// Record one completed prediction
    pub fn record_prediction(&self, latency_ms: f64) {
        self.total_predictions.fetch_add(1, Ordering::Relaxed);
        self.series.lock().latencies.push(Instant::now(), latency_ms);
    }

    /// Record one failed request, tagged by error kind
    pub fn record_error(&self, kind: &'static str) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.series.lock().errors.push(Instant::now(), kind);
    }

    pub fn record_cache(&self, event: CacheEvent) {
        self.series.lock().cache.push(Instant::now(), event);
    }

    /// Latest reachability of an analyzer
    pub fn record_connectivity(&self, analyzer_id: &str, connected: bool) {
        let mut series = self.series.lock();
        match series.connectivity.get_mut(analyzer_id) {
            Some(state) => *state = connected,
            None => {
                series.connectivity.insert(analyzer_id.to_string(), connected);
            }
        }
    }

    pub fn record_memory_usage(&self, ratio: f64) {
        self.series.lock().memory_usage = Some(ratio.clamp(0.0, 1.0));
    }

    pub fn summary(&self) -> MetricsSummary {
        let now = Instant::now();
        let mut summary = {
            let mut series = self.series.lock();
            series.latencies.prune(now);
            series.errors.prune(now);
            series.cache.prune(now);
            self.summarize(&series, now)
        };
        summary.active_alerts = self.alerts.lock().active();
        summary
    }

    fn summarize(&self, series: &Series, now: Instant) -> MetricsSummary {
        let predictions = series.latencies.len() as u64;
        let errors = series.errors.len() as u64;
        let requests = predictions + errors;

        let mut errors_by_kind = BTreeMap::new();
        for kind in series.errors.values() {
            *errors_by_kind.entry(kind.to_string()).or_insert(0u64) += 1;
        }

        let throughput_window = self.config.throughput_window();
        let recent = series.latencies.since(now, throughput_window).count();
        let throughput = if throughput_window.is_zero() {
            0.0
        } else {
            recent as f64 / throughput_window.as_secs_f64()
        };

        let analyzers_total = series.connectivity.len();
        let analyzers_connected = series.connectivity.values().filter(|c| **c).count();

        MetricsSummary {
            window_ms: self.config.window_ms,
            predictions,
            requests,
            errors,
            error_rate: ratio(errors, requests),
            errors_by_kind,
            latency: Percentiles::compute(series.latencies.values().copied()),
            throughput,
            cache: cache_effectiveness(series.cache.values()),
            analyzers_connected,
            analyzers_total,
            connectivity_ratio: if analyzers_total == 0 {
                1.0
            } else {
                analyzers_connected as f64 / analyzers_total as f64
            },
            memory_usage: series.memory_usage,
            active_alerts: Vec::new(),
            total_predictions: self.total_predictions.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }

    /// Run one alert evaluation pass over the current summary
    pub fn evaluate_alerts(&self) -> Vec<AlertChange> {
        let summary = self.summary();
        self.alerts.lock().evaluate(&summary)
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().active()
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().recent()
    }
}

impl CacheEventSink for MetricsManager {
    fn on_cache_event(&self, event: CacheEvent) {
        self.record_cache(event);
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn cache_effectiveness<'a>(events: impl Iterator<Item = &'a CacheEvent>) -> CacheEffectiveness {
    let mut stats = CacheEffectiveness::default();
    for event in events {
        match event {
            CacheEvent::Hit => stats.hits += 1,
            CacheEvent::Miss => stats.misses += 1,
            CacheEvent::Eviction => stats.evictions += 1,
            CacheEvent::Expiration => stats.expirations += 1,
        }
    }
    let lookups = stats.hits + stats.misses;
    stats.hit_ratio = ratio(stats.hits, lookups);
    stats.eviction_rate = ratio(stats.evictions, lookups);
    stats.effectiveness = stats.hit_ratio * (1.0 - EVICTION_PENALTY * stats.eviction_rate.min(1.0));
    stats
}
