//! Ensemble aggregation
//!
//! Combines per-analyzer verdicts into one result:
//! 1. Normalize base weights (kind weight x historical success rate)
//! 2. Scale each vote by its confidence and group by category
//! 3. Take the heaviest category; its score is the vote-weighted mean
//! 4. Consensus is the Herfindahl index of category vote shares
//! 5. Correct confidence for consensus and thin evidence
//! 6. Flag anomalies and compute the run's quality
//!
//! The output depends only on the set of verdicts, never on their order.

mod anomaly;
mod quality;
mod voting;

pub use voting::{consensus, normalized_weights, tally, CategoryTally, Tally};

use crate::config::EnsembleConfig;
use crate::error::{EngineError, Result};
use crate::models::{AnalyzerVerdict, EnsembleResult};

pub struct EnsembleAggregator {
    config: EnsembleConfig,
}

impl EnsembleAggregator {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Base weight for a verdict from an analyzer of `kind`
    pub fn base_weight(&self, kind: crate::models::AnalyzerKind, success_rate: f64) -> f64 {
        self.config.kind_weight(kind) * success_rate.clamp(0.0, 1.0)
    }

    /// Aggregate verdicts; zero verdicts is an error
    pub fn aggregate(&self, verdicts: &[AnalyzerVerdict]) -> Result<EnsembleResult> {
        let weights = normalized_weights(verdicts);
        let tally = tally(verdicts, &weights).ok_or_else(|| EngineError::Aggregation {
            attempted: 0,
            failed: 0,
            reason: "no analyzer verdicts to aggregate".to_string(),
        })?;
        let winning = tally.winning().cloned().unwrap_or_default();

        let n = verdicts.len();
        let consensus = if n == 1 { 1.0 } else { consensus(&tally.shares) };
        let confidence = self.adjust_confidence(winning.confidence(), consensus, n);
        let anomalies = anomaly::detect(verdicts, &tally.winner, &self.config);
        let quality = quality::score(verdicts, consensus, self.config.expected_analyzers);

        let mut contributing_analyzers: Vec<String> =
            verdicts.iter().map(|v| v.analyzer_id.clone()).collect();
        contributing_analyzers.sort();

        Ok(EnsembleResult {
            category: tally.winner,
            confidence,
            score: winning.score(),
            consensus,
            quality,
            anomalies,
            contributing_analyzers,
            vote_shares: tally.shares,
            cache_hit: false,
            generated_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    fn adjust_confidence(&self, base: f64, consensus: f64, n: usize) -> f64 {
        let c = &self.config;
        let mut confidence = base;

        // a single verdict has no real consensus to reward
        if n > 1 {
            if consensus >= c.consensus_high {
                confidence *= 1.0 + c.consensus_boost * consensus;
            } else if consensus < c.consensus_low && c.consensus_low > 0.0 {
                confidence *= 1.0 - c.consensus_penalty * (c.consensus_low - consensus) / c.consensus_low;
            }
        }

        if n < c.min_analyzers {
            let missing = (c.min_analyzers - n) as f64;
            confidence *= (1.0 - c.thin_evidence_penalty * missing).max(0.0);
        }

        if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}
