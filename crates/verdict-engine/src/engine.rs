//! Engine facade
//!
//! [`Engine`] owns every component and is the only entry point for callers:
//! `predict`, `predict_batch`, `health`, `metrics`, `invalidate_cache` and
//! `shutdown`. It is a cheap `Clone` handle; build one with
//! [`EngineBuilder`] at process start and pass it to whatever needs it.
//!
//! Background maintenance (cache sweep, rate-limiter sweep, alert
//! evaluation, breaker transition listener) runs as tokio tasks stopped by
//! a broadcast shutdown signal.

use crate::batch::{BatchOrchestrator, ItemProcessor, LoadSignals, SizingFactors};
use crate::breaker::{BreakerRegistry, BreakerState, BreakerTransition, SYSTEM_BREAKER};
use crate::cache::{CacheEvent, CacheEventSink, PredictionCache};
use crate::config::EngineConfig;
use crate::ensemble::EnsembleAggregator;
use crate::error::{EngineError, Result};
use crate::health::{
    analyzers_health, components, compute_status, health_score, metrics_health,
    system_breaker_health, ComponentHealth, ComponentStatus, HealthReport, ReadinessResponse,
    ScoreInputs,
};
use crate::inflight::{InFlightGuard, InFlightTracker, OperationKind};
use crate::metrics::{Alert, AlertChange, MetricsManager, MetricsSummary};
use crate::models::{
    AnalyzerOutput, AnalyzerVerdict, BatchOptions, BatchResponse, EnsembleResult, FeaturePayload,
    PredictOptions, ShutdownReport,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::rate_limit::{CallerRateLimiter, ANONYMOUS_CALLER};
use crate::selector::{Analyzer, AnalyzerDescriptor, AnalyzerRegistry, AnalyzerSelector, RegisteredAnalyzer};
use crate::system::{SysinfoProbe, SystemProbe};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Builds an [`Engine`] from a configuration and a set of analyzers
pub struct EngineBuilder {
    config: EngineConfig,
    analyzers: Vec<Arc<dyn Analyzer>>,
    probe: Option<Arc<dyn SystemProbe>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            analyzers: Vec::new(),
            probe: None,
        }
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.push(analyzer);
        self
    }

    pub fn analyzers<I>(mut self, analyzers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Analyzer>>,
    {
        self.analyzers.extend(analyzers);
        self
    }

    /// Memory probe used for lot sizing and health; defaults to `sysinfo`
    pub fn probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Validate the configuration, wire the components and start the
    /// maintenance tasks. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Engine> {
        let mut config = self.config;
        if config.instance_name.is_empty() {
            config.instance_name = "verdict-engine".to_string();
        }
        config.validate()?;

        if self.analyzers.is_empty() {
            return Err(EngineError::Config("at least one analyzer must be registered".to_string()));
        }
        let mut seen = HashSet::new();
        for analyzer in &self.analyzers {
            if !seen.insert(analyzer.id().to_string()) {
                return Err(EngineError::Config(format!("duplicate analyzer id '{}'", analyzer.id())));
            }
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::Config("engine must be built inside a tokio runtime".to_string()))?;

        let mut registry = AnalyzerRegistry::new();
        for analyzer in self.analyzers {
            registry.register(analyzer);
        }

        let metrics = Arc::new(MetricsManager::new(config.metrics.clone(), config.alerts.clone()));
        let prom = EngineMetrics::new()?;
        let cache_observer = Arc::new(CacheObserver {
            metrics: Arc::clone(&metrics),
            prom: prom.clone(),
        });
        let cache = Arc::new(
            PredictionCache::new(config.cache.clone())
                .with_sink(Arc::clone(&cache_observer) as Arc<dyn CacheEventSink>),
        );

        let breakers = BreakerRegistry::new(config.breaker.clone(), config.system_breaker.clone());
        let transitions = breakers.subscribe();
        for entry in registry.iter() {
            breakers.for_analyzer(entry.id());
            metrics.record_connectivity(entry.id(), true);
        }

        let rate_limiter = Arc::new(CallerRateLimiter::new(config.rate_limit.clone())?);
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SysinfoProbe::new()) as Arc<dyn SystemProbe>);
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(EngineInner {
            selector: AnalyzerSelector::new(config.request.max_analyzers_per_request),
            aggregator: EnsembleAggregator::new(config.ensemble.clone()),
            orchestrator: BatchOrchestrator::new(config.batch.clone()),
            inflight: Arc::new(InFlightTracker::new(config.request.max_in_flight)),
            logger: StructuredLogger::new(config.instance_name.clone()),
            registry,
            cache,
            cache_observer,
            breakers,
            metrics,
            prom,
            rate_limiter,
            probe,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let tasks = vec![
            runtime.spawn(Arc::clone(&inner.cache).run_sweeper(inner.shutdown_tx.subscribe())),
            runtime.spawn(Arc::clone(&inner.rate_limiter).run_sweeper(inner.shutdown_tx.subscribe())),
            runtime.spawn(run_alert_evaluation(
                Arc::downgrade(&inner),
                inner.config.alerts.evaluation_interval(),
                inner.shutdown_tx.subscribe(),
            )),
            runtime.spawn(run_transition_listener(
                Arc::downgrade(&inner),
                transitions,
                inner.shutdown_tx.subscribe(),
            )),
        ];
        *inner.tasks.lock() = tasks;

        inner
            .logger
            .log_startup(env!("CARGO_PKG_VERSION"), inner.registry.len());
        Ok(Engine { inner })
    }
}

/// Forwards cache activity to the metrics window and Prometheus
struct CacheObserver {
    metrics: Arc<MetricsManager>,
    prom: EngineMetrics,
}

impl CacheEventSink for CacheObserver {
    fn on_cache_event(&self, event: CacheEvent) {
        self.metrics.record_cache(event);
        self.prom.inc_cache_event(event.as_str());
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: AnalyzerRegistry,
    selector: AnalyzerSelector,
    aggregator: EnsembleAggregator,
    orchestrator: BatchOrchestrator,
    cache: Arc<PredictionCache>,
    cache_observer: Arc<CacheObserver>,
    breakers: BreakerRegistry,
    metrics: Arc<MetricsManager>,
    prom: EngineMetrics,
    logger: StructuredLogger,
    rate_limiter: Arc<CallerRateLimiter>,
    inflight: Arc<InFlightTracker>,
    probe: Arc<dyn SystemProbe>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // stop the sweepers when the last handle goes away without shutdown
        let _ = self.shutdown_tx.send(());
    }
}

/// Media-authenticity scoring engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Score one feature payload
    ///
    /// Fails with `Validation`, `RateLimited`, `CircuitOpen`, `Timeout`,
    /// `Aggregation` or `ShuttingDown`. Individual analyzer failures are
    /// absorbed as long as at least one analyzer produces a verdict.
    pub async fn predict(&self, features: FeaturePayload, options: PredictOptions) -> Result<EnsembleResult> {
        let started = Instant::now();
        let correlation_id = options.correlation_id.clone();

        let outcome = self.admit_and_predict(features, &options).await;
        match &outcome {
            Ok(result) => self.inner.record_success(correlation_id.as_deref(), result, started),
            Err(e) => self.inner.record_failure(correlation_id.as_deref(), e),
        }
        outcome
    }

    async fn admit_and_predict(&self, features: FeaturePayload, options: &PredictOptions) -> Result<EnsembleResult> {
        let inner = &self.inner;
        if !inner.inflight.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        inner.validate(&features)?;
        inner
            .rate_limiter
            .check(options.caller_id.as_deref().unwrap_or(ANONYMOUS_CALLER))?;

        let guard = inner.admit(OperationKind::Single, options.correlation_id.clone())?;
        let outcome = inner.predict_one(&features, options.use_cache).await;
        inner.release(guard, outcome)
    }

    /// Score many payloads; per-item failures are reported in the response
    ///
    /// Only fails as a whole for malformed input, saturation or shutdown.
    pub async fn predict_batch(&self, items: Vec<FeaturePayload>, options: BatchOptions) -> Result<BatchResponse> {
        let inner = &self.inner;
        if !inner.inflight.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        if let Err(e) = inner.orchestrator.validate(&items) {
            inner.record_failure(options.correlation_id.as_deref(), &e);
            return Err(e);
        }

        let guard = inner.admit(OperationKind::Batch, options.correlation_id.clone())?;

        let signals = inner.load_signals();
        let lot_size = inner.orchestrator.lot_size(options.lot_size, items.len(), &signals);
        let factors = SizingFactors::from_signals(&signals, inner.orchestrator.config());
        debug!(
            items = items.len(),
            suggested = ?options.lot_size,
            lot_size,
            latency_factor = factors.latency,
            load_factor = factors.load,
            memory_factor = factors.memory,
            backend_factor = factors.backend,
            "Computed adjusted lot size"
        );

        let processor = Arc::new(BatchItems {
            inner: Arc::clone(inner),
        });
        let response = inner.orchestrator.run(items, lot_size, processor).await;
        let response = inner.release(guard, Ok(response))?;

        inner.prom.record_batch(&response.metrics);
        inner
            .logger
            .log_batch_completed(options.correlation_id.as_deref(), &response.metrics);
        Ok(response)
    }

    /// Self-diagnosing health report; never fails
    pub fn health(&self) -> HealthReport {
        self.inner.health()
    }

    /// Ready to take traffic: accepting work and the system breaker is not open
    pub fn readiness(&self) -> ReadinessResponse {
        if !self.inner.inflight.is_accepting() {
            return ReadinessResponse::not_ready("engine is shutting down");
        }
        if self.inner.breakers.system().state() == BreakerState::Open {
            return ReadinessResponse::not_ready("system circuit breaker is open");
        }
        ReadinessResponse::ready()
    }

    /// Read-only snapshot of the metrics window
    pub fn metrics(&self) -> MetricsSummary {
        self.inner.metrics.summary()
    }

    /// Prometheus text exposition of this engine's metrics
    pub fn render_metrics(&self) -> Result<String> {
        self.inner.prom.render()
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.inner.metrics.recent_alerts()
    }

    /// Run one alert evaluation pass now instead of waiting for the timer
    pub fn evaluate_alerts(&self) -> Vec<AlertChange> {
        self.inner.evaluate_alerts()
    }

    pub fn analyzers(&self) -> Vec<AnalyzerDescriptor> {
        self.inner.registry.descriptors()
    }

    pub fn analyzer_breaker_state(&self, analyzer_id: &str) -> BreakerState {
        self.inner.breakers.analyzer_state(analyzer_id)
    }

    /// Drop cached results matching `predicate`, or everything when `None`
    pub fn invalidate_cache(&self, predicate: Option<&dyn Fn(&EnsembleResult) -> bool>) -> usize {
        let removed = match predicate {
            Some(predicate) => self.inner.cache.invalidate_where(predicate),
            None => self.inner.cache.invalidate_all(),
        };
        info!(removed, selective = predicate.is_some(), "Cache invalidated");
        removed
    }

    /// Stop accepting work, drain in-flight operations up to `timeout`,
    /// then stop maintenance and release the cache
    ///
    /// Calling it again is a no-op reporting a clean drain.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let inner = &self.inner;
        if !inner.inflight.stop_accepting() {
            return ShutdownReport {
                drained: true,
                pending_abandoned: 0,
            };
        }
        info!(
            in_flight = inner.inflight.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Shutdown requested, draining in-flight operations"
        );

        let pending_abandoned = inner.inflight.drain(timeout).await;
        let _ = inner.shutdown_tx.send(());

        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        let released = inner.cache.invalidate_all();
        debug!(released, "Released cached results");

        let report = ShutdownReport {
            drained: pending_abandoned == 0,
            pending_abandoned,
        };
        inner.logger.log_shutdown(report.drained, report.pending_abandoned);
        report
    }
}

impl EngineInner {
    fn validate(&self, features: &FeaturePayload) -> Result<()> {
        let limits = &self.config.request;
        let value = features.value();
        if !(value.is_object() || value.is_array()) {
            return Err(EngineError::validation("features must be a JSON object or array"));
        }
        let size = features.encoded_len();
        if size > limits.max_payload_bytes {
            return Err(EngineError::validation(format!(
                "features of {} bytes exceed limit of {}",
                size, limits.max_payload_bytes
            )));
        }
        let depth = features.depth();
        if depth > limits.max_depth {
            return Err(EngineError::validation(format!(
                "features nested {} levels deep, limit is {}",
                depth, limits.max_depth
            )));
        }
        Ok(())
    }

    fn admit(&self, kind: OperationKind, correlation_id: Option<String>) -> Result<InFlightGuard> {
        let guard = self.inflight.begin(kind, correlation_id)?;
        self.prom.set_in_flight(self.inflight.len());
        Ok(guard)
    }

    /// End an operation; results of abandoned operations are discarded
    fn release<T>(&self, guard: InFlightGuard, outcome: Result<T>) -> Result<T> {
        let abandoned = guard.is_abandoned();
        if abandoned {
            warn!(operation_id = guard.id(), "Discarding result of operation abandoned at shutdown");
        }
        drop(guard);
        self.prom.set_in_flight(self.inflight.len());
        if abandoned {
            return Err(EngineError::ShuttingDown);
        }
        outcome
    }

    /// Cache lookup, then analyzers and aggregation on a miss
    async fn predict_one(&self, features: &FeaturePayload, use_cache: bool) -> Result<EnsembleResult> {
        let key = if use_cache {
            match self.cache.key_for(features) {
                Ok(key) => {
                    if let Some(hit) = self.cache.get_by_key(&key) {
                        return Ok(hit);
                    }
                    Some(key)
                }
                Err(e) => {
                    warn!(error = %e, "Cannot derive cache key, bypassing cache");
                    self.cache_observer.on_cache_event(CacheEvent::Miss);
                    None
                }
            }
        } else {
            None
        };

        let selected = self.selector.select(&self.registry, features);
        if selected.is_empty() {
            return Err(EngineError::Aggregation {
                attempted: 0,
                failed: 0,
                reason: "no analyzer applies to this media type".to_string(),
            });
        }

        let permit = self.breakers.system().try_acquire()?;
        let limit = self.config.request.request_timeout();
        let result = match tokio::time::timeout(limit, self.run_analyzers(selected, features)).await {
            Ok(Ok(result)) => {
                permit.success();
                result
            }
            Ok(Err(e)) => {
                permit.failure(&e.to_string());
                return Err(e);
            }
            Err(_) => {
                permit.failure("request deadline exceeded");
                return Err(EngineError::Timeout {
                    operation: "predict".to_string(),
                    limit,
                });
            }
        };

        if let Some(key) = key {
            if self.inflight.is_abandoned() {
                debug!("Operation abandoned at shutdown, result not cached");
            } else if result.confidence >= self.config.cache.min_confidence {
                self.cache.put_by_key(key, &result);
            } else {
                debug!(confidence = result.confidence, "Result below caching confidence");
            }
        }
        Ok(result)
    }

    /// Invoke the selected analyzers in parallel and aggregate their verdicts
    async fn run_analyzers(
        &self,
        selected: Vec<Arc<RegisteredAnalyzer>>,
        features: &FeaturePayload,
    ) -> Result<EnsembleResult> {
        let attempted = selected.len();
        let timeout = self.config.request.analyzer_timeout();
        let mut rejected: Vec<EngineError> = Vec::new();
        let mut running = JoinSet::new();

        for entry in selected {
            let breaker = self.breakers.for_analyzer(entry.id());
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(e) => {
                    debug!(analyzer = entry.id(), "Analyzer isolated by its breaker, skipping");
                    rejected.push(e);
                    continue;
                }
            };
            let metrics = Arc::clone(&self.metrics);
            let features = features.clone();

            running.spawn(async move {
                let _busy = entry.begin();
                let started = Instant::now();
                let outcome = invoke(entry.analyzer().as_ref(), &features, timeout).await;
                let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

                match &outcome {
                    Ok(_) => permit.success(),
                    Err(reason) => {
                        warn!(analyzer = entry.id(), error = %reason, latency_ms, "Analyzer invocation failed");
                        permit.failure(reason);
                    }
                }
                let state = breaker.state();
                entry.record_outcome(outcome.is_ok(), latency_ms, state);
                metrics.record_connectivity(entry.id(), state != BreakerState::Open);

                (entry, outcome, latency_ms)
            });
        }

        let invoked = running.len();
        let mut verdicts = Vec::with_capacity(invoked);
        let mut failed = 0;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((entry, Ok(output), latency_ms)) => verdicts.push(AnalyzerVerdict {
                    analyzer_id: entry.id().to_string(),
                    kind: entry.kind(),
                    category: output.category,
                    confidence: output.confidence,
                    score: output.score,
                    weight: self.aggregator.base_weight(entry.kind(), entry.success_rate()),
                    latency_ms,
                }),
                Ok((_, Err(_), _)) => failed += 1,
                Err(e) => {
                    warn!(error = %e, "Analyzer task did not complete");
                    failed += 1;
                }
            }
        }

        if verdicts.is_empty() {
            if invoked == 0 {
                // every analyzer is isolated; surface the soonest retry
                if let Some(err) = rejected
                    .into_iter()
                    .min_by_key(|e| e.retry_after().unwrap_or(Duration::MAX))
                {
                    return Err(err);
                }
            }
            return Err(EngineError::Aggregation {
                attempted,
                failed,
                reason: "all analyzers failed".to_string(),
            });
        }

        self.aggregator.aggregate(&verdicts)
    }

    fn load_signals(&self) -> LoadSignals {
        let summary = self.metrics.summary();
        LoadSignals {
            p95_latency_ms: summary.latency.p95,
            in_flight: self.inflight.len(),
            memory_usage: summary.memory_usage.or_else(|| self.probe.memory_usage_ratio()),
            accelerated: self.config.accelerated_backend,
        }
    }

    fn record_success(&self, correlation_id: Option<&str>, result: &EnsembleResult, started: Instant) {
        let elapsed = started.elapsed();
        let latency_ms = elapsed.as_secs_f64() * 1_000.0;
        self.metrics.record_prediction(latency_ms);
        self.prom.observe_prediction(elapsed.as_secs_f64());
        self.logger.log_prediction(correlation_id, result, latency_ms);
    }

    fn record_failure(&self, correlation_id: Option<&str>, error: &EngineError) {
        if matches!(error, EngineError::ShuttingDown) {
            return;
        }
        self.metrics.record_error(error.kind());
        self.prom.inc_error(error.kind());
        self.logger.log_prediction_failed(correlation_id, error);
    }

    fn health(&self) -> HealthReport {
        let summary = self.metrics.summary();
        let system_breaker = self.breakers.system().snapshot();
        let analyzer_breakers = self.breakers.analyzer_snapshots();
        let analyzers = self.registry.descriptors();
        let cache = self.cache.stats();
        let (open, total) = self.breakers.open_ratio();
        let accepting = self.inflight.is_accepting();

        let score = health_score(&ScoreInputs {
            error_rate: summary.error_rate,
            p95_latency_ms: summary.latency.p95,
            latency_target_ms: self.config.alerts.p95_latency_ms,
            system_breaker: system_breaker.state,
            open_analyzer_breakers: open,
            total_analyzer_breakers: total,
            connectivity_ratio: summary.connectivity_ratio,
            memory_usage: summary.memory_usage,
            memory_threshold: self.config.alerts.memory_usage,
        });

        let mut parts = BTreeMap::new();
        parts.insert(
            components::LIFECYCLE.to_string(),
            if accepting {
                ComponentHealth::healthy()
            } else {
                ComponentHealth::unhealthy("shutting down")
            },
        );
        parts.insert(components::SYSTEM_BREAKER.to_string(), system_breaker_health(&system_breaker));
        parts.insert(components::ANALYZERS.to_string(), analyzers_health(&analyzers));
        parts.insert(
            components::CACHE.to_string(),
            if cache.entries >= cache.capacity {
                ComponentHealth::degraded("cache at capacity")
            } else {
                ComponentHealth::healthy()
            },
        );
        parts.insert(components::METRICS.to_string(), metrics_health(&summary));

        let status = compute_status(&parts).max(ComponentStatus::from_score(score));
        self.prom.set_health_score(score);

        HealthReport {
            status,
            score,
            accepting,
            in_flight: self.inflight.len(),
            components: parts,
            system_breaker,
            analyzer_breakers,
            analyzers,
            cache,
            metrics: summary,
            generated_at: chrono::Utc::now().timestamp(),
        }
    }

    fn evaluate_alerts(&self) -> Vec<AlertChange> {
        if let Some(ratio) = self.probe.memory_usage_ratio() {
            self.metrics.record_memory_usage(ratio);
        }
        let changes = self.metrics.evaluate_alerts();
        for change in &changes {
            self.logger.log_alert(change);
        }
        self.prom.set_active_alerts(self.metrics.active_alerts().len());
        self.health();
        changes
    }

    fn on_transition(&self, transition: &BreakerTransition) {
        self.prom
            .inc_breaker_transition(&transition.breaker, transition.to.as_str());
        self.logger.log_breaker_transition(transition);
        if transition.breaker == SYSTEM_BREAKER {
            return;
        }
        if let Some(entry) = self.registry.get(&transition.breaker) {
            entry.set_breaker_state(transition.to);
            self.metrics
                .record_connectivity(entry.id(), transition.to != BreakerState::Open);
        }
    }
}

/// Call one analyzer under its timeout and check its output contract
async fn invoke(
    analyzer: &dyn Analyzer,
    features: &FeaturePayload,
    timeout: Duration,
) -> std::result::Result<AnalyzerOutput, String> {
    match tokio::time::timeout(timeout, analyzer.analyze(features)).await {
        Ok(Ok(output)) => match output.contract_violation() {
            None => Ok(output),
            Some(violation) => Err(format!("invalid output: {}", violation)),
        },
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!("timed out after {} ms", timeout.as_millis())),
    }
}

/// Single-item path used by the batch orchestrator
struct BatchItems {
    inner: Arc<EngineInner>,
}

#[async_trait]
impl ItemProcessor for BatchItems {
    async fn process(&self, index: usize, item: FeaturePayload) -> Result<EnsembleResult> {
        let started = Instant::now();
        let outcome = match self.inner.validate(&item) {
            Ok(()) => self.inner.predict_one(&item, true).await,
            Err(e) => Err(e),
        };
        match &outcome {
            Ok(_) => {
                let elapsed = started.elapsed();
                self.inner.metrics.record_prediction(elapsed.as_secs_f64() * 1_000.0);
                self.inner.prom.observe_prediction(elapsed.as_secs_f64());
            }
            Err(e) => {
                debug!(index, error = %e, "Batch item failed");
                self.inner.metrics.record_error(e.kind());
                self.inner.prom.inc_error(e.kind());
            }
        }
        outcome
    }
}

async fn run_alert_evaluation(engine: Weak<EngineInner>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(period.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = period.as_millis() as u64, "Starting alert evaluation");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = engine.upgrade() else { break };
                inner.evaluate_alerts();
            }
            _ = shutdown.recv() => {
                info!("Alert evaluation shutting down");
                break;
            }
        }
    }
}

async fn run_transition_listener(
    engine: Weak<EngineInner>,
    mut transitions: broadcast::Receiver<BreakerTransition>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            received = transitions.recv() => match received {
                Ok(transition) => {
                    let Some(inner) = engine.upgrade() else { break };
                    inner.on_transition(&transition);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Breaker transition listener lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    debug!("Breaker transition listener stopped");
}
