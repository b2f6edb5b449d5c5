use super::{BreakerSnapshot, BreakerState, BreakerTransition, CircuitBreaker};
use crate::config::BreakerConfig;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Name of the breaker guarding the engine's own critical path
pub const SYSTEM_BREAKER: &str = "system";

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// Owns the system breaker and one breaker per analyzer
///
/// Analyzer breakers are created when analyzers are registered, so the map
/// is bounded by the analyzer registry.
pub struct BreakerRegistry {
    analyzer_config: BreakerConfig,
    system: Arc<CircuitBreaker>,
    analyzers: DashMap<String, Arc<CircuitBreaker>>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl BreakerRegistry {
    pub fn new(analyzer_config: BreakerConfig, system_config: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let system = Arc::new(
            CircuitBreaker::new(SYSTEM_BREAKER, system_config).with_transitions(transitions.clone()),
        );
        Self {
            analyzer_config,
            system,
            analyzers: DashMap::new(),
            transitions,
        }
    }

    pub fn system(&self) -> &Arc<CircuitBreaker> {
        &self.system
    }

    /// Breaker for `analyzer_id`, created on first use
    pub fn for_analyzer(&self, analyzer_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.analyzers.get(analyzer_id) {
            return Arc::clone(existing.value());
        }
        let entry = self.analyzers.entry(analyzer_id.to_string()).or_insert_with(|| {
            Arc::new(
                CircuitBreaker::new(analyzer_id, self.analyzer_config.clone())
                    .with_transitions(self.transitions.clone()),
            )
        });
        Arc::clone(entry.value())
    }

    pub fn analyzer_state(&self, analyzer_id: &str) -> BreakerState {
        self.analyzers
            .get(analyzer_id)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Receive every transition of every breaker
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Analyzer breaker snapshots sorted by name
    pub fn analyzer_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .analyzers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// (open, total) counts across analyzer breakers
    pub fn open_ratio(&self) -> (usize, usize) {
        let total = self.analyzers.len();
        let open = self
            .analyzers
            .iter()
            .filter(|entry| entry.value().state() == BreakerState::Open)
            .count();
        (open, total)
    }
}
