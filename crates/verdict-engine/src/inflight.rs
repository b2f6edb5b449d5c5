//! In-flight operation tracking
//!
//! Every accepted `predict` or `predict_batch` call holds a guard for its
//! lifetime. Shutdown stops admissions and waits for the set to empty; what
//! remains at the deadline is marked abandoned and its results discarded.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Retry hint when the in-flight limit is reached
const SATURATED_RETRY_HINT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Single,
    Batch,
}

#[derive(Debug, Clone, Serialize)]
pub struct InFlightOperation {
    pub id: String,
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

pub struct InFlightTracker {
    operations: DashMap<String, InFlightOperation>,
    count: AtomicUsize,
    count_tx: watch::Sender<usize>,
    max_in_flight: usize,
    accepting: AtomicBool,
    abandoned: AtomicBool,
}

impl InFlightTracker {
    pub fn new(max_in_flight: usize) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            operations: DashMap::new(),
            count: AtomicUsize::new(0),
            count_tx,
            max_in_flight: max_in_flight.max(1),
            accepting: AtomicBool::new(true),
            abandoned: AtomicBool::new(false),
        }
    }

    /// Admit an operation, or refuse while shutting down or saturated
    pub fn begin(
        self: &Arc<Self>,
        kind: OperationKind,
        correlation_id: Option<String>,
    ) -> Result<InFlightGuard> {
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        let previous = self.count.fetch_add(1, Ordering::SeqCst);
        if previous >= self.max_in_flight {
            self.count.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::RateLimited {
                caller: "engine".to_string(),
                limit: u32::try_from(self.max_in_flight).unwrap_or(u32::MAX),
                window: Duration::ZERO,
                retry_after: SATURATED_RETRY_HINT,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.operations.insert(
            id.clone(),
            InFlightOperation {
                id: id.clone(),
                kind,
                started_at: Utc::now(),
                correlation_id,
            },
        );
        self.count_tx.send_replace(previous + 1);

        Ok(InFlightGuard {
            tracker: Arc::clone(self),
            id,
        })
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop admitting work; returns false if already stopped
    pub fn stop_accepting(&self) -> bool {
        self.accepting.swap(false, Ordering::SeqCst)
    }

    /// Whether operations still running have been given up on
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<InFlightOperation> {
        let mut ops: Vec<InFlightOperation> = self.operations.iter().map(|e| e.value().clone()).collect();
        ops.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        ops
    }

    /// Wait for in-flight work to finish, up to `timeout`
    ///
    /// Returns the number of operations abandoned at the deadline.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let mut rx = self.count_tx.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|_| self.is_empty())).await;
        match drained {
            Ok(_) => 0,
            Err(_) => {
                self.abandoned.store(true, Ordering::SeqCst);
                let pending = self.len();
                for op in self.snapshot() {
                    warn!(
                        operation_id = %op.id,
                        kind = ?op.kind,
                        correlation_id = op.correlation_id.as_deref().unwrap_or(""),
                        "Abandoning in-flight operation at shutdown deadline"
                    );
                }
                pending
            }
        }
    }

    fn finish(&self, id: &str) {
        self.operations.remove(id);
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        self.count_tx.send_replace(previous.saturating_sub(1));
    }
}

/// Keeps an operation registered until dropped
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    id: String,
}

impl InFlightGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether shutdown gave up on this operation
    pub fn is_abandoned(&self) -> bool {
        self.tracker.is_abandoned()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.finish(&self.id);
    }
}
