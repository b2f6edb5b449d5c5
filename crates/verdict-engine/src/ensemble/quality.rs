//! Quality of an ensemble run, independent of verdict correctness

use crate::models::{AnalyzerKind, AnalyzerVerdict};
use std::collections::HashSet;

const DIVERSITY_WEIGHT: f64 = 0.25;
const CONFIDENCE_WEIGHT: f64 = 0.30;
const CONSENSUS_WEIGHT: f64 = 0.30;
const COVERAGE_WEIGHT: f64 = 0.15;

/// Blend of analyzer count, mean confidence, consensus and kind coverage
pub fn score(verdicts: &[AnalyzerVerdict], consensus: f64, expected_analyzers: usize) -> f64 {
    if verdicts.is_empty() {
        return 0.0;
    }
    let n = verdicts.len() as f64;
    let diversity = (n / expected_analyzers.max(1) as f64).min(1.0);
    let mean_confidence = verdicts.iter().map(|v| v.confidence).sum::<f64>() / n;
    let kinds: HashSet<AnalyzerKind> = verdicts.iter().map(|v| v.kind).collect();
    let coverage = kinds.len() as f64 / AnalyzerKind::ALL.len() as f64;

    (DIVERSITY_WEIGHT * diversity
        + CONFIDENCE_WEIGHT * mean_confidence
        + CONSENSUS_WEIGHT * consensus
        + COVERAGE_WEIGHT * coverage)
        .clamp(0.0, 1.0)
}
