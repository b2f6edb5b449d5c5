//! Observability infrastructure for the scoring engine
//!
//! Provides:
//! - Prometheus metrics (prediction latency, errors, cache activity, breaker
//!   transitions, batch outcomes, health score) on a per-engine registry
//! - Structured logging with tracing

use crate::breaker::BreakerTransition;
use crate::error::{EngineError, Result};
use crate::metrics::{AlertChange, AlertSeverity};
use crate::models::{BatchMetrics, EnsembleResult};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::{info, warn};

/// Histogram buckets for prediction latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Prometheus metrics owned by one engine instance
///
/// Each engine registers into its own [`Registry`], so several engines
/// (or tests) in one process never collide on metric names.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    prediction_latency_seconds: Histogram,
    predictions: IntCounter,
    errors: IntCounterVec,
    cache_events: IntCounterVec,
    breaker_transitions: IntCounterVec,
    batch_items: IntCounterVec,
    in_flight: IntGauge,
    active_alerts: IntGauge,
    health_score: IntGauge,
    last_lot_size: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let prediction_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "verdict_prediction_latency_seconds",
                "End-to-end latency of successful predictions",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let predictions = IntCounter::new(
            "verdict_predictions_total",
            "Total number of successful predictions",
        )?;
        let errors = IntCounterVec::new(
            Opts::new("verdict_errors_total", "Failed requests by error kind"),
            &["kind"],
        )?;
        let cache_events = IntCounterVec::new(
            Opts::new("verdict_cache_events_total", "Prediction cache activity"),
            &["event"],
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new(
                "verdict_breaker_transitions_total",
                "Circuit breaker state changes",
            ),
            &["breaker", "to"],
        )?;
        let batch_items = IntCounterVec::new(
            Opts::new("verdict_batch_items_total", "Batch items by outcome"),
            &["outcome"],
        )?;
        let in_flight = IntGauge::new("verdict_in_flight", "Operations currently in flight")?;
        let active_alerts = IntGauge::new("verdict_active_alerts", "Currently active alerts")?;
        let health_score = IntGauge::new("verdict_health_score", "Last computed health score (0-100)")?;
        let last_lot_size = IntGauge::new("verdict_batch_lot_size", "Lot size of the latest batch")?;

        registry.register(Box::new(prediction_latency_seconds.clone()))?;
        registry.register(Box::new(predictions.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(cache_events.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(batch_items.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(active_alerts.clone()))?;
        registry.register(Box::new(health_score.clone()))?;
        registry.register(Box::new(last_lot_size.clone()))?;

        Ok(Self {
            registry,
            prediction_latency_seconds,
            predictions,
            errors,
            cache_events,
            breaker_transitions,
            batch_items,
            in_flight,
            active_alerts,
            health_score,
            last_lot_size,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a successful prediction
    pub fn observe_prediction(&self, latency_secs: f64) {
        self.prediction_latency_seconds.observe(latency_secs);
        self.predictions.inc();
    }

    pub fn inc_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_cache_event(&self, event: &str) {
        self.cache_events.with_label_values(&[event]).inc();
    }

    pub fn inc_breaker_transition(&self, breaker: &str, to: &str) {
        self.breaker_transitions.with_label_values(&[breaker, to]).inc();
    }

    pub fn record_batch(&self, metrics: &BatchMetrics) {
        self.batch_items
            .with_label_values(&["success"])
            .inc_by(metrics.succeeded as u64);
        self.batch_items
            .with_label_values(&["failed"])
            .inc_by(metrics.failed as u64);
        self.last_lot_size.set(metrics.lot_size as i64);
    }

    pub fn set_in_flight(&self, count: usize) {
        self.in_flight.set(count as i64);
    }

    pub fn set_active_alerts(&self, count: usize) {
        self.active_alerts.set(count as i64);
    }

    pub fn set_health_score(&self, score: u8) {
        self.health_score.set(i64::from(score));
    }

    /// Text exposition of every metric in this engine's registry
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| EngineError::Internal(format!("metrics encoding: {}", e)))
    }
}

/// Structured logger for engine events
///
/// Every record carries an `event` field and the engine instance name, so
/// logs can be filtered without parsing messages.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn log_prediction(&self, correlation_id: Option<&str>, result: &EnsembleResult, latency_ms: f64) {
        info!(
            event = "prediction_completed",
            instance = %self.instance,
            correlation_id = correlation_id.unwrap_or(""),
            category = %result.category,
            confidence = result.confidence,
            consensus = result.consensus,
            quality = result.quality,
            analyzers = result.contributing_analyzers.len(),
            anomalies = result.anomalies.len(),
            cache_hit = result.cache_hit,
            latency_ms = latency_ms,
            "Prediction completed"
        );
    }

    pub fn log_prediction_failed(&self, correlation_id: Option<&str>, error: &EngineError) {
        warn!(
            event = "prediction_failed",
            instance = %self.instance,
            correlation_id = correlation_id.unwrap_or(""),
            error_kind = error.kind(),
            error = %error,
            "Prediction failed"
        );
    }

    pub fn log_breaker_transition(&self, transition: &BreakerTransition) {
        warn!(
            event = "breaker_transition",
            instance = %self.instance,
            breaker = %transition.breaker,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            consecutive_failures = transition.consecutive_failures,
            reason = transition.reason.as_deref().unwrap_or(""),
            "Circuit breaker changed state"
        );
    }

    pub fn log_alert(&self, change: &AlertChange) {
        match change {
            AlertChange::Raised(alert) if alert.severity >= AlertSeverity::High => {
                warn!(
                    event = "alert_raised",
                    instance = %self.instance,
                    alert_id = %alert.id,
                    kind = %alert.kind,
                    severity = %alert.severity,
                    observed = alert.observed_value,
                    threshold = alert.threshold,
                    "{}",
                    alert.description
                );
            }
            AlertChange::Raised(alert) => {
                info!(
                    event = "alert_raised",
                    instance = %self.instance,
                    alert_id = %alert.id,
                    kind = %alert.kind,
                    severity = %alert.severity,
                    observed = alert.observed_value,
                    threshold = alert.threshold,
                    "{}",
                    alert.description
                );
            }
            AlertChange::Resolved(alert) => {
                info!(
                    event = "alert_resolved",
                    instance = %self.instance,
                    alert_id = %alert.id,
                    kind = %alert.kind,
                    observed = alert.observed_value,
                    "Alert resolved"
                );
            }
        }
    }

    pub fn log_batch_completed(&self, correlation_id: Option<&str>, metrics: &BatchMetrics) {
        info!(
            event = "batch_completed",
            instance = %self.instance,
            correlation_id = correlation_id.unwrap_or(""),
            total = metrics.total,
            succeeded = metrics.succeeded,
            failed = metrics.failed,
            lot_size = metrics.lot_size,
            lots = metrics.lots,
            final_concurrency = metrics.final_concurrency,
            total_time_ms = metrics.total_time_ms,
            throughput = metrics.throughput,
            "Batch completed"
        );
    }

    pub fn log_startup(&self, version: &str, analyzers: usize) {
        info!(
            event = "engine_started",
            instance = %self.instance,
            engine_version = %version,
            analyzers = analyzers,
            "Scoring engine started"
        );
    }

    pub fn log_shutdown(&self, drained: bool, pending_abandoned: usize) {
        if drained {
            info!(
                event = "engine_shutdown",
                instance = %self.instance,
                drained = drained,
                "Scoring engine shut down"
            );
        } else {
            warn!(
                event = "engine_shutdown",
                instance = %self.instance,
                drained = drained,
                pending_abandoned = pending_abandoned,
                "Scoring engine shut down with work abandoned"
            );
        }
    }
}
