//! Batch orchestration
//!
//! A batch is split into lots that run concurrently up to a limit. Each lot
//! has its own timeout, capped by the batch deadline. A lot that times out or
//! crashes turns into per-item failures; sibling lots keep running. When a
//! lot's error ratio crosses the shedding threshold, concurrency is halved
//! and a cooldown is inserted before the next lot starts.

mod partition;
mod sizing;

pub use partition::partition;
pub use sizing::{adjusted_lot_size, LoadSignals, SizingFactors};

use crate::config::BatchConfig;
use crate::error::{EngineError, Result};
use crate::models::{BatchMetrics, BatchResponse, EnsembleResult, FeaturePayload, ItemOutcome};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Runs the single-item path for items of a batch
#[async_trait]
pub trait ItemProcessor: Send + Sync + 'static {
    async fn process(&self, index: usize, item: FeaturePayload) -> Result<EnsembleResult>;
}

pub struct BatchOrchestrator {
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Reject empty, oversized or overlong batches before any work starts
    pub fn validate(&self, items: &[FeaturePayload]) -> Result<()> {
        if items.is_empty() {
            return Err(EngineError::validation("batch must contain at least one item"));
        }
        if items.len() > self.config.max_items {
            return Err(EngineError::validation(format!(
                "batch of {} items exceeds limit of {}",
                items.len(),
                self.config.max_items
            )));
        }
        let mut total = 0usize;
        for item in items {
            total = total.saturating_add(item.encoded_len());
            if total > self.config.max_payload_bytes {
                return Err(EngineError::validation(format!(
                    "batch payload exceeds {} bytes",
                    self.config.max_payload_bytes
                )));
            }
        }
        Ok(())
    }

    pub fn lot_size(&self, suggested: Option<usize>, items: usize, signals: &LoadSignals) -> usize {
        adjusted_lot_size(suggested, items, signals, &self.config)
    }

    /// Drive all lots to completion; never fails as a whole
    pub async fn run<P: ItemProcessor>(
        &self,
        items: Vec<FeaturePayload>,
        lot_size: usize,
        processor: Arc<P>,
    ) -> BatchResponse {
        let started = Instant::now();
        let deadline = started + self.config.batch_timeout();
        let total = items.len();
        let items = Arc::new(items);
        let lots = partition(&items, lot_size);
        let lot_count = lots.len();

        let mut results: Vec<Option<ItemOutcome>> = vec![None; total];
        let mut pending = lots.into_iter().enumerate();
        let mut unreported: BTreeSet<usize> = BTreeSet::new();
        let mut lot_members: Vec<Vec<usize>> = Vec::with_capacity(lot_count);
        let mut concurrency = self.config.max_concurrency.max(1);
        let mut running = JoinSet::new();

        loop {
            while running.len() < concurrency {
                let Some((lot_no, indices)) = pending.next() else {
                    break;
                };
                lot_members.push(indices.clone());
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    for outcome in fail_all(&items, &indices, "batch deadline exceeded", "timeout") {
                        let index = outcome.index();
                        results[index] = Some(outcome);
                    }
                    continue;
                }
                let limit = self.config.lot_timeout().min(remaining);
                unreported.insert(lot_no);
                running.spawn(run_lot(
                    lot_no,
                    indices,
                    Arc::clone(&items),
                    Arc::clone(&processor),
                    limit,
                ));
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (lot_no, outcomes) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // run_lot contains item panics itself; this is a cancelled lot
                    warn!(error = %e, "Lot task did not complete");
                    continue;
                }
            };
            unreported.remove(&lot_no);

            let failed = outcomes.iter().filter(|o| o.is_error()).count();
            let lot_len = outcomes.len();
            for outcome in outcomes {
                let index = outcome.index();
                results[index] = Some(outcome);
            }

            let error_rate = if lot_len == 0 { 0.0 } else { failed as f64 / lot_len as f64 };
            debug!(lot = lot_no, items = lot_len, failed, error_rate, "Lot completed");
            if error_rate > self.config.error_rate_threshold {
                let reduced = (concurrency / 2).max(1);
                warn!(
                    lot = lot_no,
                    error_rate,
                    from = concurrency,
                    to = reduced,
                    "Lot error rate above threshold, shedding concurrency"
                );
                concurrency = reduced;
                tokio::time::sleep(self.config.cooldown()).await;
            }
        }

        for lot_no in unreported {
            if let Some(indices) = lot_members.get(lot_no) {
                for outcome in fail_all(&items, indices, "lot aborted", "internal") {
                    let index = outcome.index();
                    results[index] = Some(outcome);
                }
            }
        }

        let results: Vec<ItemOutcome> = results
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.unwrap_or_else(|| ItemOutcome::Failed {
                    index,
                    reason: "item was not processed".to_string(),
                    error_kind: "internal".to_string(),
                    item: items[index].clone(),
                })
            })
            .collect();

        let succeeded = results.iter().filter(|r| !r.is_error()).count();
        let elapsed = started.elapsed();
        BatchResponse {
            metrics: BatchMetrics {
                total,
                succeeded,
                failed: total - succeeded,
                success_rate: if total == 0 { 0.0 } else { succeeded as f64 / total as f64 },
                total_time_ms: elapsed.as_secs_f64() * 1_000.0,
                throughput: throughput(total, elapsed),
                lot_size,
                lots: lot_count,
                final_concurrency: concurrency,
            },
            results,
        }
    }
}

/// Run one lot's items concurrently under a timeout
async fn run_lot<P: ItemProcessor>(
    lot_no: usize,
    indices: Vec<usize>,
    items: Arc<Vec<FeaturePayload>>,
    processor: Arc<P>,
    limit: Duration,
) -> (usize, Vec<ItemOutcome>) {
    let handles: Vec<_> = indices
        .iter()
        .map(|&index| {
            let processor = Arc::clone(&processor);
            let item = items[index].clone();
            (index, tokio::spawn(async move { processor.process(index, item).await }))
        })
        .collect();
    let aborts: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();

    let collect = async {
        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, handle) in handles {
            let item = items[index].clone();
            let outcome = match handle.await {
                Ok(Ok(result)) => ItemOutcome::Success { index, result },
                Ok(Err(e)) => ItemOutcome::Failed {
                    index,
                    reason: e.to_string(),
                    error_kind: e.kind().to_string(),
                    item,
                },
                Err(e) => ItemOutcome::Failed {
                    index,
                    reason: format!("item task failed: {}", e),
                    error_kind: "internal".to_string(),
                    item,
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    };

    match tokio::time::timeout(limit, collect).await {
        Ok(outcomes) => (lot_no, outcomes),
        Err(_) => {
            for abort in aborts {
                abort.abort();
            }
            warn!(lot = lot_no, items = indices.len(), limit_ms = limit.as_millis() as u64, "Lot timed out");
            let reason = format!("lot timed out after {} ms", limit.as_millis());
            (lot_no, fail_all(&items, &indices, &reason, "timeout"))
        }
    }
}

fn fail_all(items: &[FeaturePayload], indices: &[usize], reason: &str, kind: &str) -> Vec<ItemOutcome> {
    indices
        .iter()
        .map(|&index| ItemOutcome::Failed {
            index,
            reason: reason.to_string(),
            error_kind: kind.to_string(),
            item: items[index].clone(),
        })
        .collect()
}

fn throughput(items: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        items as f64 / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result() -> EnsembleResult {
        EnsembleResult {
            category: "authentic".to_string(),
            confidence: 0.9,
            score: 0.1,
            consensus: 1.0,
            quality: 0.8,
            anomalies: Vec::new(),
            contributing_analyzers: vec!["pixel-1".to_string()],
            vote_shares: BTreeMap::new(),
            cache_hit: false,
            generated_at: 0,
        }
    }

    /// Fails items whose `id` is listed, sleeps for items marked slow
    struct Scripted {
        failing: Vec<u64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ItemProcessor for Scripted {
        async fn process(&self, _index: usize, item: FeaturePayload) -> Result<EnsembleResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = item.value()["id"].as_u64().unwrap_or(0);
            if item.value()["slow"].as_bool().unwrap_or(false) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if item.value()["panic"].as_bool().unwrap_or(false) {
                panic!("analyzer blew up");
            }
            if self.failing.contains(&id) {
                return Err(EngineError::Aggregation {
                    attempted: 3,
                    failed: 3,
                    reason: "every analyzer failed".to_string(),
                });
            }
            Ok(result())
        }
    }

    fn items(n: u64) -> Vec<FeaturePayload> {
        (0..n).map(|id| FeaturePayload::new(json!({"id": id}))).collect()
    }

    fn orchestrator() -> BatchOrchestrator {
        BatchOrchestrator::new(BatchConfig {
            lot_timeout_ms: 1_000,
            cooldown_ms: 10,
            ..BatchConfig::default()
        })
    }

    #[tokio::test]
    async fn test_partial_failure_is_data() {
        let processor = Arc::new(Scripted {
            failing: vec![3, 7],
            calls: AtomicUsize::new(0),
        });
        let response = orchestrator().run(items(10), 4, processor.clone()).await;

        assert_eq!(response.results.len(), 10);
        let failed: Vec<usize> = response
            .results
            .iter()
            .filter(|r| r.is_error())
            .map(|r| r.index())
            .collect();
        assert_eq!(failed, vec![3, 7]);
        assert!((response.metrics.success_rate - 0.8).abs() < 1e-12);
        assert_eq!(response.metrics.lots, 3);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 10);
        assert!(response.results.iter().enumerate().all(|(i, r)| r.index() == i));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_lot_fails_only_its_items() {
        let mut batch = items(6);
        batch[4] = FeaturePayload::new(json!({"id": 4, "slow": true}));
        let processor = Arc::new(Scripted {
            failing: Vec::new(),
            calls: AtomicUsize::new(0),
        });
        let response = orchestrator().run(batch, 2, processor).await;

        let failed: Vec<usize> = response.results.iter().filter(|r| r.is_error()).map(|r| r.index()).collect();
        assert_eq!(failed, vec![4, 5]);
        match &response.results[5] {
            ItemOutcome::Failed { error_kind, item, .. } => {
                assert_eq!(error_kind, "timeout");
                assert_eq!(item.value()["id"], 5);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_item_is_contained() {
        let mut batch = items(4);
        batch[1] = FeaturePayload::new(json!({"id": 1, "panic": true}));
        let processor = Arc::new(Scripted {
            failing: Vec::new(),
            calls: AtomicUsize::new(0),
        });
        let response = orchestrator().run(batch, 4, processor).await;
        assert_eq!(response.metrics.failed, 1);
        assert!(response.results[1].is_error());
    }

    #[tokio::test]
    async fn test_high_lot_error_rate_sheds_concurrency() {
        let processor = Arc::new(Scripted {
            failing: (0..8).collect(),
            calls: AtomicUsize::new(0),
        });
        let response = orchestrator().run(items(16), 4, processor).await;
        assert_eq!(response.metrics.failed, 8);
        assert!(response.metrics.final_concurrency < 4);
    }

    /// Sleeps `delay_ms` per item and records how many items overlap
    #[derive(Default)]
    struct Paced {
        delay_ms: u64,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ItemProcessor for Paced {
        async fn process(&self, _index: usize, _item: FeaturePayload) -> Result<EnsembleResult> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(result())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lots_in_flight_never_exceed_max_concurrency() {
        let orch = BatchOrchestrator::new(BatchConfig {
            max_concurrency: 2,
            lot_timeout_ms: 1_000,
            ..BatchConfig::default()
        });
        let processor = Arc::new(Paced {
            delay_ms: 50,
            ..Paced::default()
        });

        // one item per lot, so overlapping items are overlapping lots
        let response = orch.run(items(8), 1, processor.clone()).await;

        assert_eq!(response.metrics.succeeded, 8);
        assert_eq!(response.metrics.lots, 8);
        assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
        assert_eq!(processor.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_deadline_fails_unfinished_items_and_keeps_finished() {
        let orch = BatchOrchestrator::new(BatchConfig {
            max_concurrency: 1,
            lot_timeout_ms: 1_000,
            batch_timeout_ms: 1_500,
            ..BatchConfig::default()
        });
        let processor = Arc::new(Paced {
            delay_ms: 600,
            ..Paced::default()
        });

        // lots finish at 600 and 1200 ms; the third is cut to the 300 ms left
        let response = orch.run(items(5), 1, processor).await;

        assert!(!response.results[0].is_error());
        assert!(!response.results[1].is_error());
        assert_eq!(response.metrics.succeeded, 2);
        assert_eq!(response.metrics.failed, 3);
        match &response.results[2] {
            ItemOutcome::Failed { error_kind, reason, .. } => {
                assert_eq!(error_kind, "timeout");
                assert_eq!(reason, "lot timed out after 300 ms");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        for outcome in &response.results[3..] {
            match outcome {
                ItemOutcome::Failed { error_kind, reason, item, .. } => {
                    assert_eq!(error_kind, "timeout");
                    assert_eq!(reason, "batch deadline exceeded");
                    assert_eq!(item.value()["id"], outcome.index() as u64);
                }
                other => panic!("expected failure, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_validation() {
        let orch = orchestrator();
        assert!(matches!(orch.validate(&[]), Err(EngineError::Validation(_))));
        assert!(orch.validate(&items(3)).is_ok());

        let small = BatchOrchestrator::new(BatchConfig {
            max_items: 2,
            ..BatchConfig::default()
        });
        assert!(small.validate(&items(3)).is_err());

        let tiny = BatchOrchestrator::new(BatchConfig {
            max_payload_bytes: 16,
            ..BatchConfig::default()
        });
        assert!(tiny.validate(&items(5)).is_err());
    }
}
