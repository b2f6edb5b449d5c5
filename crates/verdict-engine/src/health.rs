//! Health reporting for the scoring engine
//!
//! Combines component statuses, breaker states, cache stats and the metrics
//! summary into one self-diagnosing report with a 0-100 health score,
//! suitable for liveness and readiness probing by a process supervisor.

use crate::breaker::{BreakerSnapshot, BreakerState};
use crate::cache::CacheStats;
use crate::metrics::{AlertSeverity, MetricsSummary};
use crate::selector::{AnalyzerDescriptor, AnalyzerState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Score at or above which the engine is healthy
pub const HEALTHY_SCORE: u8 = 80;
/// Score at or above which the engine is degraded rather than unhealthy
pub const DEGRADED_SCORE: u8 = 50;

const MAX_ERROR_PENALTY: f64 = 30.0;
const MAX_LATENCY_PENALTY: f64 = 20.0;
const SYSTEM_OPEN_PENALTY: f64 = 30.0;
const SYSTEM_HALF_OPEN_PENALTY: f64 = 15.0;
const OPEN_BREAKER_PENALTY: f64 = 15.0;
const CONNECTIVITY_PENALTY: f64 = 15.0;
const MAX_MEMORY_PENALTY: f64 = 10.0;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Component is experiencing issues but still operational
    Degraded,
    /// Component has failed
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }

    pub fn from_score(score: u8) -> Self {
        if score >= HEALTHY_SCORE {
            ComponentStatus::Healthy
        } else if score >= DEGRADED_SCORE {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }

    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Component names in the health report
pub mod components {
    pub const LIFECYCLE: &str = "lifecycle";
    pub const SYSTEM_BREAKER: &str = "system_breaker";
    pub const ANALYZERS: &str = "analyzers";
    pub const CACHE: &str = "cache";
    pub const METRICS: &str = "metrics";
}

/// Worst status across components
pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
    components
        .values()
        .map(|c| c.status)
        .max()
        .unwrap_or(ComponentStatus::Healthy)
}

/// Full engine health
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    /// 0 (down) to 100 (fully healthy)
    pub score: u8,
    pub accepting: bool,
    pub in_flight: usize,
    pub components: BTreeMap<String, ComponentHealth>,
    pub system_breaker: BreakerSnapshot,
    pub analyzer_breakers: Vec<BreakerSnapshot>,
    pub analyzers: Vec<AnalyzerDescriptor>,
    pub cache: CacheStats,
    pub metrics: MetricsSummary,
    pub generated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadinessResponse {
    pub fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
        }
    }

    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
        }
    }
}

/// Inputs to the health score
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    pub latency_target_ms: f64,
    pub system_breaker: BreakerState,
    pub open_analyzer_breakers: usize,
    pub total_analyzer_breakers: usize,
    pub connectivity_ratio: f64,
    pub memory_usage: Option<f64>,
    pub memory_threshold: f64,
}

/// Deterministic weighted penalty score
///
/// Starts at 100 and subtracts bounded penalties for error rate, latency
/// over target, system breaker state, open analyzer breakers, lost
/// connectivity and memory above threshold.
pub fn health_score(inputs: &ScoreInputs) -> u8 {
    let mut penalty = 0.0;

    penalty += (inputs.error_rate.max(0.0) * 100.0).min(MAX_ERROR_PENALTY);

    if inputs.latency_target_ms > 0.0 && inputs.p95_latency_ms > inputs.latency_target_ms {
        let over = (inputs.p95_latency_ms - inputs.latency_target_ms) / inputs.latency_target_ms;
        penalty += MAX_LATENCY_PENALTY * over.min(1.0);
    }

    penalty += match inputs.system_breaker {
        BreakerState::Open => SYSTEM_OPEN_PENALTY,
        BreakerState::HalfOpen => SYSTEM_HALF_OPEN_PENALTY,
        BreakerState::Closed => 0.0,
    };

    if inputs.total_analyzer_breakers > 0 {
        let open = inputs.open_analyzer_breakers as f64 / inputs.total_analyzer_breakers as f64;
        penalty += OPEN_BREAKER_PENALTY * open;
    }

    penalty += CONNECTIVITY_PENALTY * (1.0 - inputs.connectivity_ratio.clamp(0.0, 1.0));

    if let Some(used) = inputs.memory_usage {
        if used > inputs.memory_threshold && inputs.memory_threshold < 1.0 {
            let over = (used - inputs.memory_threshold) / (1.0 - inputs.memory_threshold);
            penalty += MAX_MEMORY_PENALTY * over.min(1.0);
        }
    }

    (100.0 - penalty).clamp(0.0, 100.0).round() as u8
}

pub fn system_breaker_health(snapshot: &BreakerSnapshot) -> ComponentHealth {
    match snapshot.state {
        BreakerState::Closed => ComponentHealth::healthy(),
        BreakerState::HalfOpen => ComponentHealth::degraded("system breaker probing recovery"),
        BreakerState::Open => ComponentHealth::unhealthy(format!(
            "system breaker open: {}",
            snapshot.last_error.as_deref().unwrap_or("repeated failures")
        )),
    }
}

pub fn analyzers_health(analyzers: &[AnalyzerDescriptor]) -> ComponentHealth {
    if analyzers.is_empty() {
        return ComponentHealth::unhealthy("no analyzers registered");
    }
    let disconnected = analyzers
        .iter()
        .filter(|a| a.state == AnalyzerState::Disconnected)
        .count();
    let degraded = analyzers
        .iter()
        .filter(|a| a.state == AnalyzerState::Degraded)
        .count();

    if disconnected == analyzers.len() {
        ComponentHealth::unhealthy("all analyzers disconnected")
    } else if disconnected > 0 || degraded > 0 {
        ComponentHealth::degraded(format!(
            "{} disconnected, {} degraded of {}",
            disconnected,
            degraded,
            analyzers.len()
        ))
    } else {
        ComponentHealth::healthy()
    }
}

pub fn metrics_health(summary: &MetricsSummary) -> ComponentHealth {
    let critical = summary
        .active_alerts
        .iter()
        .filter(|a| a.severity == AlertSeverity::Critical)
        .count();
    match (critical, summary.active_alerts.len()) {
        (0, 0) => ComponentHealth::healthy(),
        (0, n) => ComponentHealth::degraded(format!("{} active alerts", n)),
        (c, n) => ComponentHealth::degraded(format!("{} active alerts, {} critical", n, c)),
    }
}
