//! Inference core for media-authenticity scoring
//!
//! This crate provides:
//! - Parallel, breaker-guarded invocation of external feature analyzers
//! - Confidence-weighted ensemble voting with consensus and anomaly checks
//! - A content-addressed prediction cache with TTL and LRU eviction
//! - Adaptive batch orchestration with partial-failure semantics
//! - Sliding-window metrics, alerting, health scoring and Prometheus exposition

pub mod batch;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod engine;
pub mod ensemble;
pub mod error;
pub mod health;
pub mod inflight;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod rate_limit;
pub mod selector;
pub mod system;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
pub use health::{ComponentHealth, ComponentStatus, HealthReport, ReadinessResponse};
pub use metrics::{Alert, AlertKind, AlertSeverity, MetricsSummary};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use selector::{Analyzer, AnalyzerDescriptor, AnalyzerState};
pub use system::{StaticProbe, SysinfoProbe, SystemProbe};
