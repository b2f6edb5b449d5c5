//! Threshold alerts with hysteresis
//!
//! An alert is raised when its metric crosses the configured threshold and
//! resolved only once the metric has recrossed it by the hysteresis margin.
//! Alerts are ephemeral: resolved ones are kept in a bounded recent set.

use super::MetricsSummary;
use crate::config::AlertThresholds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    /// Severity from how far past its threshold a metric is (1.0 = at threshold)
    pub fn from_exceedance(ratio: f64) -> Self {
        if ratio >= 2.0 {
            AlertSeverity::Critical
        } else if ratio >= 1.5 {
            AlertSeverity::High
        } else if ratio >= 1.2 {
            AlertSeverity::Medium
        } else {
            AlertSeverity::Low
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Low => write!(f, "low"),
            AlertSeverity::Medium => write!(f, "medium"),
            AlertSeverity::High => write!(f, "high"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    HighLatency,
    LowCacheHitRatio,
    HighMemoryUsage,
}

impl AlertKind {
    pub fn metric(&self) -> &'static str {
        match self {
            AlertKind::HighErrorRate => "error_rate",
            AlertKind::HighLatency => "latency_p95_ms",
            AlertKind::LowCacheHitRatio => "cache_hit_ratio",
            AlertKind::HighMemoryUsage => "memory_usage_ratio",
        }
    }

    /// Whether the metric is bad when it falls below the threshold
    fn lower_is_worse(&self) -> bool {
        matches!(self, AlertKind::LowCacheHitRatio)
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::HighErrorRate => write!(f, "HighErrorRate"),
            AlertKind::HighLatency => write!(f, "HighLatency"),
            AlertKind::LowCacheHitRatio => write!(f, "LowCacheHitRatio"),
            AlertKind::HighMemoryUsage => write!(f, "HighMemoryUsage"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub description: String,
    pub metric: String,
    pub threshold: f64,
    pub observed_value: f64,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Result of one evaluation pass
#[derive(Debug, Clone)]
pub enum AlertChange {
    Raised(Alert),
    Resolved(Alert),
}

/// One metric reading to evaluate
struct Reading {
    kind: AlertKind,
    observed: f64,
    threshold: f64,
    /// Enough samples to raise a new alert
    sufficient: bool,
}

pub struct AlertEvaluator {
    thresholds: AlertThresholds,
    active: HashMap<AlertKind, Alert>,
    recent: VecDeque<Alert>,
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            active: HashMap::new(),
            recent: VecDeque::new(),
        }
    }

    /// Compare a summary against thresholds and raise/resolve alerts
    pub fn evaluate(&mut self, summary: &MetricsSummary) -> Vec<AlertChange> {
        let t = &self.thresholds;
        let min = t.min_samples;
        let cache_lookups = summary.cache.hits + summary.cache.misses;

        let mut readings = vec![
            Reading {
                kind: AlertKind::HighErrorRate,
                observed: summary.error_rate,
                threshold: t.error_rate,
                sufficient: summary.requests >= min,
            },
            Reading {
                kind: AlertKind::HighLatency,
                observed: summary.latency.p95,
                threshold: t.p95_latency_ms,
                sufficient: summary.predictions >= min,
            },
        ];
        // no lookups says nothing about the hit ratio; hold the current state
        if cache_lookups > 0 {
            readings.push(Reading {
                kind: AlertKind::LowCacheHitRatio,
                observed: summary.cache.hit_ratio,
                threshold: t.cache_hit_ratio,
                sufficient: cache_lookups >= min,
            });
        }
        if let Some(memory) = summary.memory_usage {
            readings.push(Reading {
                kind: AlertKind::HighMemoryUsage,
                observed: memory,
                threshold: t.memory_usage,
                sufficient: true,
            });
        }

        readings
            .into_iter()
            .filter_map(|reading| self.apply(reading))
            .collect()
    }

    fn apply(&mut self, reading: Reading) -> Option<AlertChange> {
        let Reading {
            kind,
            observed,
            threshold,
            sufficient,
        } = reading;
        let hysteresis = self.thresholds.hysteresis;
        let lower_is_worse = kind.lower_is_worse();

        let crossed = if lower_is_worse {
            observed < threshold
        } else {
            observed > threshold
        };
        let recovered = if lower_is_worse {
            observed >= threshold * (1.0 + hysteresis)
        } else {
            observed <= threshold * (1.0 - hysteresis)
        };
        let exceedance = if lower_is_worse {
            if observed > 0.0 {
                threshold / observed
            } else {
                f64::INFINITY
            }
        } else if threshold > 0.0 {
            observed / threshold
        } else {
            f64::INFINITY
        };

        if recovered {
            let mut resolved = self.active.remove(&kind)?;
            resolved.observed_value = observed;
            resolved.resolved_at = Some(Utc::now());
            self.remember(resolved.clone());
            return Some(AlertChange::Resolved(resolved));
        }

        if let Some(alert) = self.active.get_mut(&kind) {
            // still firing, or inside the hysteresis band
            alert.observed_value = observed;
            if crossed {
                alert.severity = alert.severity.max(AlertSeverity::from_exceedance(exceedance));
            }
            return None;
        }

        if crossed && sufficient {
            let alert = Alert {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                severity: AlertSeverity::from_exceedance(exceedance),
                description: describe(kind, observed, threshold),
                metric: kind.metric().to_string(),
                threshold,
                observed_value: observed,
                raised_at: Utc::now(),
                resolved_at: None,
            };
            self.active.insert(kind, alert.clone());
            self.remember(alert.clone());
            return Some(AlertChange::Raised(alert));
        }
        None
    }

    fn remember(&mut self, alert: Alert) {
        // one slot per alert id; a resolution replaces its raise
        self.recent.retain(|a| a.id != alert.id);
        if self.recent.len() >= self.thresholds.max_recent.max(1) {
            self.recent.pop_front();
        }
        self.recent.push_back(alert);
    }

    /// Currently firing alerts, most severe first
    pub fn active(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.values().cloned().collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.raised_at.cmp(&b.raised_at)));
        alerts
    }

    pub fn recent(&self) -> Vec<Alert> {
        self.recent.iter().cloned().collect()
    }
}

fn describe(kind: AlertKind, observed: f64, threshold: f64) -> String {
    match kind {
        AlertKind::HighErrorRate => format!(
            "Error rate {:.1}% above threshold {:.1}%",
            observed * 100.0,
            threshold * 100.0
        ),
        AlertKind::HighLatency => format!(
            "p95 latency {:.0} ms above threshold {:.0} ms",
            observed, threshold
        ),
        AlertKind::LowCacheHitRatio => format!(
            "Cache hit ratio {:.1}% below threshold {:.1}%",
            observed * 100.0,
            threshold * 100.0
        ),
        AlertKind::HighMemoryUsage => format!(
            "Memory usage {:.1}% above threshold {:.1}%",
            observed * 100.0,
            threshold * 100.0
        ),
    }
}
