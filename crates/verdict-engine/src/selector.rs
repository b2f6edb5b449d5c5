//! Analyzer registry and per-request selection
//!
//! Analyzers are registered once when the engine is built and never removed;
//! failures only mark their descriptor degraded or disconnected. Selection
//! filters by media type and ranks by state, priority, load and latency.

use crate::breaker::BreakerState;
use crate::models::{AnalyzerKind, AnalyzerOutput, FeaturePayload};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Outcomes remembered per analyzer for the degraded check
const RECENT_OUTCOMES: usize = 20;

/// Error ratio over recent outcomes above which an analyzer is degraded
const DEGRADED_ERROR_RATIO: f64 = 0.25;

pub const DEFAULT_PRIORITY: u8 = 50;

/// External feature analyzer
///
/// Implementations wrap the actual extraction heuristics. A failure or an
/// output violating [`AnalyzerOutput::contract_violation`] excludes the
/// analyzer's vote and counts against its circuit breaker.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Unique identifier
    fn id(&self) -> &str;

    fn kind(&self) -> AnalyzerKind;

    /// Higher runs first when the per-request cap applies
    fn priority(&self) -> u8 {
        DEFAULT_PRIORITY
    }

    async fn analyze(&self, features: &FeaturePayload) -> anyhow::Result<AnalyzerOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerState {
    Active,
    Degraded,
    Disconnected,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunningStats {
    pub count: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

impl RunningStats {
    /// Laplace-smoothed success rate, 0.5 before any call
    pub fn success_rate(&self) -> f64 {
        (self.count.saturating_sub(self.errors) + 1) as f64 / (self.count + 2) as f64
    }
}

/// Snapshot of an analyzer's standing
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerDescriptor {
    pub id: String,
    pub kind: AnalyzerKind,
    pub priority: u8,
    pub state: AnalyzerState,
    pub stats: RunningStats,
    pub breaker_state: BreakerState,
    pub in_flight: u32,
}

#[derive(Debug)]
struct Standing {
    state: AnalyzerState,
    stats: RunningStats,
    recent: VecDeque<bool>,
    breaker_state: BreakerState,
}

impl Standing {
    fn recompute(&mut self) {
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        let error_ratio = if self.recent.is_empty() {
            0.0
        } else {
            failures as f64 / self.recent.len() as f64
        };
        self.state = match self.breaker_state {
            BreakerState::Open => AnalyzerState::Disconnected,
            BreakerState::HalfOpen => AnalyzerState::Degraded,
            BreakerState::Closed if error_ratio > DEGRADED_ERROR_RATIO => AnalyzerState::Degraded,
            BreakerState::Closed => AnalyzerState::Active,
        };
    }
}

/// A registered analyzer with its mutable standing
pub struct RegisteredAnalyzer {
    analyzer: Arc<dyn Analyzer>,
    id: String,
    kind: AnalyzerKind,
    priority: u8,
    standing: Mutex<Standing>,
    in_flight: AtomicU32,
}

impl RegisteredAnalyzer {
    fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            id: analyzer.id().to_string(),
            kind: analyzer.kind(),
            priority: analyzer.priority(),
            analyzer,
            standing: Mutex::new(Standing {
                state: AnalyzerState::Active,
                stats: RunningStats::default(),
                recent: VecDeque::with_capacity(RECENT_OUTCOMES),
                breaker_state: BreakerState::Closed,
            }),
            in_flight: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> AnalyzerKind {
        self.kind
    }

    pub fn analyzer(&self) -> &Arc<dyn Analyzer> {
        &self.analyzer
    }

    pub fn state(&self) -> AnalyzerState {
        self.standing.lock().state
    }

    pub fn success_rate(&self) -> f64 {
        self.standing.lock().stats.success_rate()
    }

    /// Mark one invocation as running until the guard drops
    pub fn begin(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            entry: Arc::clone(self),
        }
    }

    /// Fold one invocation outcome into the running stats
    pub fn record_outcome(&self, success: bool, latency_ms: f64, breaker_state: BreakerState) {
        let mut standing = self.standing.lock();
        let stats = &mut standing.stats;
        stats.count += 1;
        if !success {
            stats.errors += 1;
        }
        stats.avg_latency_ms += (latency_ms - stats.avg_latency_ms) / stats.count as f64;

        if standing.recent.len() >= RECENT_OUTCOMES {
            standing.recent.pop_front();
        }
        standing.recent.push_back(success);
        standing.breaker_state = breaker_state;
        standing.recompute();
    }

    /// Apply a breaker transition observed elsewhere
    pub fn set_breaker_state(&self, breaker_state: BreakerState) {
        let mut standing = self.standing.lock();
        standing.breaker_state = breaker_state;
        standing.recompute();
    }

    pub fn descriptor(&self) -> AnalyzerDescriptor {
        let standing = self.standing.lock();
        AnalyzerDescriptor {
            id: self.id.clone(),
            kind: self.kind,
            priority: self.priority,
            state: standing.state,
            stats: standing.stats.clone(),
            breaker_state: standing.breaker_state,
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

pub struct InFlightGuard {
    entry: Arc<RegisteredAnalyzer>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Fixed set of analyzers known to the engine
#[derive(Default)]
pub struct AnalyzerRegistry {
    entries: Vec<Arc<RegisteredAnalyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an analyzer; an id already present is replaced
    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) {
        let entry = Arc::new(RegisteredAnalyzer::new(analyzer));
        match self.entries.iter().position(|e| e.id == entry.id) {
            Some(pos) => self.entries[pos] = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<RegisteredAnalyzer>> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisteredAnalyzer>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> Vec<AnalyzerDescriptor> {
        self.entries.iter().map(|e| e.descriptor()).collect()
    }
}

/// Chooses and ranks analyzers for a request
pub struct AnalyzerSelector {
    max_per_request: usize,
}

impl AnalyzerSelector {
    pub fn new(max_per_request: usize) -> Self {
        Self {
            max_per_request: max_per_request.max(1),
        }
    }

    /// Analyzers relevant to `features`, best first
    ///
    /// Disconnected analyzers stay in the list, ranked last, so that their
    /// breaker can admit a recovery trial once its interval has elapsed.
    pub fn select(&self, registry: &AnalyzerRegistry, features: &FeaturePayload) -> Vec<Arc<RegisteredAnalyzer>> {
        let media = features.media_type();

        let mut ranked: Vec<(AnalyzerDescriptor, Arc<RegisteredAnalyzer>)> = registry
            .iter()
            .filter(|entry| media.map_or(true, |m| entry.kind.applies_to(m)))
            .map(|entry| (entry.descriptor(), Arc::clone(entry)))
            .collect();

        ranked.sort_by(|(a, _), (b, _)| rank(a, b));
        ranked.truncate(self.max_per_request);
        ranked.into_iter().map(|(_, entry)| entry).collect()
    }
}

fn rank(a: &AnalyzerDescriptor, b: &AnalyzerDescriptor) -> CmpOrdering {
    a.state
        .cmp(&b.state)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.in_flight.cmp(&b.in_flight))
        .then_with(|| a.stats.avg_latency_ms.total_cmp(&b.stats.avg_latency_ms))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed {
        id: &'static str,
        kind: AnalyzerKind,
        priority: u8,
    }

    #[async_trait]
    impl Analyzer for Fixed {
        fn id(&self) -> &str {
            self.id
        }

        fn kind(&self) -> AnalyzerKind {
            self.kind
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        async fn analyze(&self, _features: &FeaturePayload) -> anyhow::Result<AnalyzerOutput> {
            Ok(AnalyzerOutput::new("authentic", 0.9, 0.1))
        }
    }

    fn registry() -> AnalyzerRegistry {
        let mut registry = AnalyzerRegistry::new();
        for (id, kind, priority) in [
            ("pixel-1", AnalyzerKind::Pixel, 50),
            ("watermark-1", AnalyzerKind::Watermark, 80),
            ("metadata-1", AnalyzerKind::Metadata, 50),
            ("temporal-1", AnalyzerKind::Temporal, 90),
        ] {
            registry.register(Arc::new(Fixed { id, kind, priority }));
        }
        registry
    }

    fn ids(selected: &[Arc<RegisteredAnalyzer>]) -> Vec<&str> {
        selected.iter().map(|e| e.id()).collect()
    }

    #[test]
    fn test_image_requests_skip_temporal_analyzers() {
        let registry = registry();
        let selector = AnalyzerSelector::new(8);
        let image = FeaturePayload::new(json!({"tipo": "imagen"}));
        let selected = selector.select(&registry, &image);
        assert_eq!(ids(&selected), vec!["watermark-1", "metadata-1", "pixel-1"]);

        let video = FeaturePayload::new(json!({"media_type": "video"}));
        assert_eq!(selector.select(&registry, &video)[0].id(), "temporal-1");

        let untyped = FeaturePayload::new(json!({"luma": 0.4}));
        assert_eq!(selector.select(&registry, &untyped).len(), 4);
    }

    #[test]
    fn test_degraded_and_disconnected_rank_last() {
        let registry = registry();
        let watermark = registry.get("watermark-1").unwrap();
        watermark.record_outcome(false, 10.0, BreakerState::Closed);
        assert_eq!(watermark.state(), AnalyzerState::Degraded);

        let metadata = registry.get("metadata-1").unwrap();
        metadata.set_breaker_state(BreakerState::Open);
        assert_eq!(metadata.state(), AnalyzerState::Disconnected);

        let selector = AnalyzerSelector::new(8);
        let selected = selector.select(&registry, &FeaturePayload::new(json!({"tipo": "imagen"})));
        assert_eq!(ids(&selected), vec!["pixel-1", "watermark-1", "metadata-1"]);
    }

    #[test]
    fn test_load_breaks_priority_ties_and_cap_applies() {
        let registry = registry();
        let pixel = registry.get("pixel-1").unwrap();
        let _busy = pixel.begin();

        let selector = AnalyzerSelector::new(2);
        let selected = selector.select(&registry, &FeaturePayload::new(json!({"tipo": "foto"})));
        assert_eq!(ids(&selected), vec!["watermark-1", "metadata-1"]);
        assert_eq!(pixel.descriptor().in_flight, 1);
    }

    #[test]
    fn test_running_stats() {
        let registry = registry();
        let pixel = registry.get("pixel-1").unwrap();
        assert_eq!(pixel.success_rate(), 0.5);
        for latency in [10.0, 20.0, 30.0] {
            pixel.record_outcome(true, latency, BreakerState::Closed);
        }
        let d = pixel.descriptor();
        assert_eq!(d.stats.count, 3);
        assert!((d.stats.avg_latency_ms - 20.0).abs() < 1e-9);
        assert!((pixel.success_rate() - 0.8).abs() < 1e-9);
        assert_eq!(d.state, AnalyzerState::Active);
    }
}
