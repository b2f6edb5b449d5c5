//! Anomaly flags for one ensemble run
//!
//! Flags are observational only; they never change the verdict.

use crate::config::EnsembleConfig;
use crate::models::{AnalyzerVerdict, Anomaly, AnomalyKind};

/// Verdicts needed before a standard deviation means anything
const MIN_VERDICTS_FOR_OUTLIERS: usize = 3;

/// Population mean and standard deviation
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

pub fn detect(verdicts: &[AnalyzerVerdict], winner: &str, config: &EnsembleConfig) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    confidence_outliers(verdicts, config, &mut anomalies);
    confident_minority(verdicts, winner, config, &mut anomalies);
    slow_analyzers(verdicts, config, &mut anomalies);
    anomalies
}

fn confidence_outliers(verdicts: &[AnalyzerVerdict], config: &EnsembleConfig, out: &mut Vec<Anomaly>) {
    if verdicts.len() < MIN_VERDICTS_FOR_OUTLIERS {
        return;
    }
    let confidences: Vec<f64> = verdicts.iter().map(|v| v.confidence).collect();
    let (mean, std_dev) = mean_std(&confidences);
    if std_dev < f64::EPSILON {
        return;
    }
    for v in verdicts {
        let z_score = (v.confidence - mean).abs() / std_dev;
        if z_score > config.outlier_std_devs {
            out.push(Anomaly {
                kind: AnomalyKind::ConfidenceOutlier,
                analyzer_id: v.analyzer_id.clone(),
                description: format!(
                    "confidence {:.3} is {:.1} std devs from group mean {:.3}",
                    v.confidence, z_score, mean
                ),
                observed: v.confidence,
                threshold: config.outlier_std_devs,
            });
        }
    }
}

fn confident_minority(
    verdicts: &[AnalyzerVerdict],
    winner: &str,
    config: &EnsembleConfig,
    out: &mut Vec<Anomaly>,
) {
    for v in verdicts {
        if v.category != winner && v.confidence > config.minority_confidence {
            out.push(Anomaly {
                kind: AnomalyKind::ConfidentMinority,
                analyzer_id: v.analyzer_id.clone(),
                description: format!(
                    "voted '{}' with confidence {:.3} against winning '{}'",
                    v.category, v.confidence, winner
                ),
                observed: v.confidence,
                threshold: config.minority_confidence,
            });
        }
    }
}

fn slow_analyzers(verdicts: &[AnalyzerVerdict], config: &EnsembleConfig, out: &mut Vec<Anomaly>) {
    if verdicts.len() < 2 {
        return;
    }
    let latencies: Vec<f64> = verdicts.iter().map(|v| v.latency_ms).collect();
    let (mean, _) = mean_std(&latencies);
    if mean <= f64::EPSILON {
        return;
    }
    let limit = mean * config.slow_latency_factor;
    for v in verdicts {
        if v.latency_ms > limit {
            out.push(Anomaly {
                kind: AnomalyKind::SlowAnalyzer,
                analyzer_id: v.analyzer_id.clone(),
                description: format!(
                    "latency {:.1} ms exceeds {:.1}x group mean {:.1} ms",
                    v.latency_ms, config.slow_latency_factor, mean
                ),
                observed: v.latency_ms,
                threshold: limit,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalyzerKind;

    fn verdict(id: &str, category: &str, confidence: f64, latency_ms: f64) -> AnalyzerVerdict {
        AnalyzerVerdict {
            analyzer_id: id.to_string(),
            kind: AnalyzerKind::Metadata,
            category: category.to_string(),
            confidence,
            score: 0.5,
            weight: 1.0,
            latency_ms,
        }
    }

    #[test]
    fn test_confidence_outlier() {
        let mut verdicts: Vec<AnalyzerVerdict> = (0..9)
            .map(|i| verdict(&format!("a{}", i), "authentic", 0.9, 10.0))
            .collect();
        verdicts.push(verdict("low", "authentic", 0.1, 10.0));

        let anomalies = detect(&verdicts, "authentic", &EnsembleConfig::default());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::ConfidenceOutlier);
        assert_eq!(anomalies[0].analyzer_id, "low");
    }

    #[test]
    fn test_confident_minority_and_slow_analyzer() {
        let verdicts = vec![
            verdict("a", "authentic", 0.7, 10.0),
            verdict("b", "authentic", 0.7, 10.0),
            verdict("c", "authentic", 0.7, 10.0),
            verdict("d", "authentic", 0.7, 10.0),
            verdict("e", "deepfake", 0.85, 200.0),
        ];
        let anomalies = detect(&verdicts, "authentic", &EnsembleConfig::default());
        let kinds: Vec<AnomalyKind> = anomalies.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AnomalyKind::ConfidentMinority));
        assert!(kinds.contains(&AnomalyKind::SlowAnalyzer));
        assert!(anomalies.iter().all(|a| a.analyzer_id == "e"));
    }

    #[test]
    fn test_uniform_group_has_no_anomalies() {
        let verdicts = vec![
            verdict("a", "authentic", 0.8, 10.0),
            verdict("b", "authentic", 0.8, 12.0),
            verdict("c", "authentic", 0.8, 11.0),
        ];
        assert!(detect(&verdicts, "authentic", &EnsembleConfig::default()).is_empty());
    }
}
