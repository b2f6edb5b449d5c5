//! Core data models for the scoring engine

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Payload fields consulted to determine the media type of a request
const MEDIA_TYPE_FIELDS: &[&str] = &["media_type", "type", "tipo", "kind"];

/// Opaque feature payload submitted for scoring
///
/// The engine only hashes it for cache keys, size-validates it and reads
/// its media type hint. Cloning is cheap and the content is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeaturePayload(Arc<Value>);

impl FeaturePayload {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Media type hint carried by the payload, if any
    pub fn media_type(&self) -> Option<MediaType> {
        let object = self.0.as_object()?;
        MEDIA_TYPE_FIELDS
            .iter()
            .filter_map(|field| object.get(*field).and_then(Value::as_str))
            .find_map(MediaType::parse)
    }

    /// Grouping label for kind-balanced batching
    pub fn kind_label(&self) -> Option<String> {
        let object = self.0.as_object()?;
        MEDIA_TYPE_FIELDS
            .iter()
            .find_map(|field| object.get(*field).and_then(Value::as_str))
            .map(|s| s.to_lowercase())
    }

    /// Serialized size in bytes
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self.0.as_ref()).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// Maximum nesting depth of objects and arrays
    pub fn depth(&self) -> usize {
        fn walk(value: &Value) -> usize {
            match value {
                Value::Array(items) => 1 + items.iter().map(walk).max().unwrap_or(0),
                Value::Object(map) => 1 + map.values().map(walk).max().unwrap_or(0),
                _ => 0,
            }
        }
        walk(&self.0)
    }
}

impl From<Value> for FeaturePayload {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Media type of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "image" | "imagen" | "img" | "photo" | "foto" => Some(MediaType::Image),
            "video" | "vídeo" | "clip" => Some(MediaType::Video),
            _ => None,
        }
    }
}

/// Family of feature analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    /// Pixel-level statistics (luminance, blockiness)
    Pixel,
    /// Invisible watermark decoding
    Watermark,
    /// EXIF and container metadata
    Metadata,
    /// Signed provenance manifests
    Provenance,
    /// Frame-to-frame consistency
    Temporal,
}

impl AnalyzerKind {
    pub const ALL: [AnalyzerKind; 5] = [
        AnalyzerKind::Pixel,
        AnalyzerKind::Watermark,
        AnalyzerKind::Metadata,
        AnalyzerKind::Provenance,
        AnalyzerKind::Temporal,
    ];

    /// Whether this kind of analyzer has an opinion on the given media type
    pub fn applies_to(&self, media: MediaType) -> bool {
        match self {
            AnalyzerKind::Temporal => media == MediaType::Video,
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerKind::Pixel => "pixel",
            AnalyzerKind::Watermark => "watermark",
            AnalyzerKind::Metadata => "metadata",
            AnalyzerKind::Provenance => "provenance",
            AnalyzerKind::Temporal => "temporal",
        }
    }
}

impl fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw output of one analyzer invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerOutput {
    pub category: String,
    pub confidence: f64,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AnalyzerOutput {
    pub fn new(category: impl Into<String>, confidence: f64, score: f64) -> Self {
        Self {
            category: category.into(),
            confidence,
            score,
            metadata: None,
        }
    }

    /// Reason the output violates the analyzer contract, if it does
    pub fn contract_violation(&self) -> Option<String> {
        if self.category.trim().is_empty() {
            return Some("empty category".to_string());
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Some(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if !self.score.is_finite() {
            return Some("non-finite score".to_string());
        }
        None
    }
}

/// One analyzer's opinion about one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerVerdict {
    pub analyzer_id: String,
    pub kind: AnalyzerKind,
    pub category: String,
    pub confidence: f64,
    pub score: f64,
    /// Base weight before normalization (kind weight x success rate)
    pub weight: f64,
    pub latency_ms: f64,
}

/// Observation attached to an ensemble result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub analyzer_id: String,
    pub description: String,
    pub observed: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Confidence far from the group mean
    ConfidenceOutlier,
    /// Confident vote for a losing category
    ConfidentMinority,
    /// Latency far above the group mean
    SlowAnalyzer,
}

/// Aggregated verdict returned to callers and stored in the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub category: String,
    pub confidence: f64,
    pub score: f64,
    pub consensus: f64,
    pub quality: f64,
    pub anomalies: Vec<Anomaly>,
    pub contributing_analyzers: Vec<String>,
    /// Share of confidence-weighted votes per category
    pub vote_shares: BTreeMap<String, f64>,
    /// Whether this result was served from the cache
    pub cache_hit: bool,
    pub generated_at: i64,
}

/// Options for a single prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
    pub correlation_id: Option<String>,
    pub caller_id: Option<String>,
    pub use_cache: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            correlation_id: None,
            caller_id: None,
            use_cache: true,
        }
    }
}

impl PredictOptions {
    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Options for a batch prediction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Suggested lot size; adjusted to live load
    pub lot_size: Option<usize>,
    pub correlation_id: Option<String>,
}

/// Per-item outcome inside a batch response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Success {
        index: usize,
        result: EnsembleResult,
    },
    Failed {
        index: usize,
        reason: String,
        error_kind: String,
        item: FeaturePayload,
    },
}

impl ItemOutcome {
    pub fn index(&self) -> usize {
        match self {
            ItemOutcome::Success { index, .. } | ItemOutcome::Failed { index, .. } => *index,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }

    pub fn result(&self) -> Option<&EnsembleResult> {
        match self {
            ItemOutcome::Success { result, .. } => Some(result),
            ItemOutcome::Failed { .. } => None,
        }
    }
}

/// Aggregate figures for one batch call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub total_time_ms: f64,
    /// Items per second
    pub throughput: f64,
    pub lot_size: usize,
    pub lots: usize,
    /// Lot concurrency in effect when the batch finished
    pub final_concurrency: usize,
}

/// Response of a batch call, results ordered by input index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<ItemOutcome>,
    pub metrics: BatchMetrics,
}

/// Outcome of an engine shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub drained: bool,
    pub pending_abandoned: usize,
}
