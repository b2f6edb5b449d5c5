//! Confidence-weighted voting and consensus

use crate::models::AnalyzerVerdict;
use std::collections::BTreeMap;

/// Accumulated votes for one category
#[derive(Debug, Clone, Default)]
pub struct CategoryTally {
    /// Sum of normalized weight x confidence
    pub votes: f64,
    /// Sum of normalized weights, confidence ignored
    pub weight: f64,
    pub count: usize,
    /// Sum of vote x score
    weighted_score: f64,
    /// Sum of normalized weight x confidence, for the group confidence
    weighted_confidence: f64,
    score_sum: f64,
}

impl CategoryTally {
    /// Vote-weighted mean score, plain mean when every vote is zero
    pub fn score(&self) -> f64 {
        if self.votes > f64::EPSILON {
            self.weighted_score / self.votes
        } else if self.count > 0 {
            self.score_sum / self.count as f64
        } else {
            0.0
        }
    }

    /// Weight-normalized mean confidence of the group
    pub fn confidence(&self) -> f64 {
        if self.weight > f64::EPSILON {
            self.weighted_confidence / self.weight
        } else {
            0.0
        }
    }
}

/// Outcome of tallying one request's verdicts
#[derive(Debug, Clone)]
pub struct Tally {
    pub categories: BTreeMap<String, CategoryTally>,
    pub winner: String,
    /// Share of the total vote per category, summing to 1
    pub shares: BTreeMap<String, f64>,
}

impl Tally {
    pub fn winning(&self) -> Option<&CategoryTally> {
        self.categories.get(&self.winner)
    }
}

/// Base weights normalized to sum to 1
///
/// Non-finite or negative weights count as zero; if nothing is left every
/// verdict weighs the same.
pub fn normalized_weights(verdicts: &[AnalyzerVerdict]) -> Vec<f64> {
    let raw: Vec<f64> = verdicts
        .iter()
        .map(|v| if v.weight.is_finite() && v.weight > 0.0 { v.weight } else { 0.0 })
        .collect();
    let total: f64 = raw.iter().sum();
    if total <= f64::EPSILON {
        let equal = 1.0 / verdicts.len().max(1) as f64;
        return vec![equal; verdicts.len()];
    }
    raw.into_iter().map(|w| w / total).collect()
}

/// Group confidence-weighted votes by category and pick the winner
///
/// Returns `None` for an empty slice. Ties on votes go to the category with
/// more analyzers, then to the lexicographically smaller name, so the result
/// does not depend on verdict order.
pub fn tally(verdicts: &[AnalyzerVerdict], weights: &[f64]) -> Option<Tally> {
    if verdicts.is_empty() {
        return None;
    }

    let mut categories: BTreeMap<String, CategoryTally> = BTreeMap::new();
    for (verdict, weight) in verdicts.iter().zip(weights) {
        let vote = weight * verdict.confidence;
        let entry = categories.entry(verdict.category.clone()).or_default();
        entry.votes += vote;
        entry.weight += weight;
        entry.count += 1;
        entry.weighted_score += vote * verdict.score;
        entry.weighted_confidence += weight * verdict.confidence;
        entry.score_sum += verdict.score;
    }

    let winner = categories
        .iter()
        .max_by(|(name_a, a), (name_b, b)| {
            a.votes
                .total_cmp(&b.votes)
                .then(a.count.cmp(&b.count))
                .then(name_b.cmp(name_a))
        })
        .map(|(name, _)| name.clone())?;

    let total_votes: f64 = categories.values().map(|c| c.votes).sum();
    let shares = categories
        .iter()
        .map(|(name, c)| {
            let share = if total_votes > f64::EPSILON {
                c.votes / total_votes
            } else {
                // all confidences zero: fall back to nominal weight
                c.weight
            };
            (name.clone(), share)
        })
        .collect();

    Some(Tally {
        categories,
        winner,
        shares,
    })
}

/// Herfindahl concentration of vote shares
///
/// 1.0 when one category holds every vote, 1/k for an even split across k
/// categories.
pub fn consensus(shares: &BTreeMap<String, f64>) -> f64 {
    shares.values().map(|s| s * s).sum::<f64>().clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalyzerKind;

    fn verdict(id: &str, category: &str, confidence: f64, score: f64) -> AnalyzerVerdict {
        AnalyzerVerdict {
            analyzer_id: id.to_string(),
            kind: AnalyzerKind::Pixel,
            category: category.to_string(),
            confidence,
            score,
            weight: 1.0,
            latency_ms: 10.0,
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let mut verdicts = vec![verdict("a", "x", 0.5, 0.0), verdict("b", "x", 0.5, 0.0)];
        verdicts[0].weight = 3.0;
        let w = normalized_weights(&verdicts);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((w[0] - 0.75).abs() < 1e-12);

        verdicts[0].weight = f64::NAN;
        verdicts[1].weight = 0.0;
        assert_eq!(normalized_weights(&verdicts), vec![0.5, 0.5]);
    }

    #[test]
    fn test_low_confidence_votes_count_less() {
        let verdicts = vec![
            verdict("a", "deepfake", 0.95, 0.9),
            verdict("b", "authentic", 0.3, 0.1),
            verdict("c", "authentic", 0.3, 0.2),
        ];
        let weights = normalized_weights(&verdicts);
        let t = tally(&verdicts, &weights).unwrap();
        assert_eq!(t.winner, "deepfake");
        assert!((t.winning().unwrap().score() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_tie_break_is_order_independent() {
        let a = vec![verdict("a", "edited", 0.8, 0.0), verdict("b", "authentic", 0.8, 0.0)];
        let b = vec![a[1].clone(), a[0].clone()];
        let wa = normalized_weights(&a);
        let wb = normalized_weights(&b);
        assert_eq!(tally(&a, &wa).unwrap().winner, "authentic");
        assert_eq!(tally(&b, &wb).unwrap().winner, "authentic");
    }

    #[test]
    fn test_consensus_bounds() {
        let unanimous: Vec<AnalyzerVerdict> =
            (0..5).map(|i| verdict(&i.to_string(), "authentic", 0.9, 0.1)).collect();
        let w = normalized_weights(&unanimous);
        assert!((consensus(&tally(&unanimous, &w).unwrap().shares) - 1.0).abs() < 1e-12);

        let split: Vec<AnalyzerVerdict> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|c| verdict(c, c, 0.7, 0.5))
            .collect();
        let w = normalized_weights(&split);
        assert!((consensus(&tally(&split, &w).unwrap().shares) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_empty_tally() {
        assert!(tally(&[], &[]).is_none());
    }
}
