//! Integration tests for the engine facade

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use verdict_engine::batch::{BatchOrchestrator, LoadSignals};
use verdict_engine::breaker::BreakerState;
use verdict_engine::health::components;
use verdict_engine::{
    Analyzer, AnalyzerKind, AnalyzerOutput, BatchOptions, ComponentStatus, Engine, EngineConfig,
    EngineError, FeaturePayload, ItemOutcome, PredictOptions, StaticProbe,
};

/// Analyzer returning a fixed verdict, optionally failing or stalling
struct Scripted {
    id: &'static str,
    kind: AnalyzerKind,
    category: &'static str,
    confidence: f64,
    calls: AtomicUsize,
    failing: AtomicBool,
    fail_ids: HashSet<u64>,
    delay: Duration,
}

impl Scripted {
    fn new(id: &'static str, kind: AnalyzerKind, category: &'static str, confidence: f64) -> Self {
        Self {
            id,
            kind,
            category,
            confidence,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            fail_ids: HashSet::new(),
            delay: Duration::ZERO,
        }
    }

    fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    fn failing_for(mut self, ids: &[u64]) -> Self {
        self.fail_ids = ids.iter().copied().collect();
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for Scripted {
    fn id(&self) -> &str {
        self.id
    }

    fn kind(&self) -> AnalyzerKind {
        self.kind
    }

    async fn analyze(&self, features: &FeaturePayload) -> anyhow::Result<AnalyzerOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("{} backend unavailable", self.id);
        }
        if let Some(id) = features.value().get("id").and_then(|v| v.as_u64()) {
            if self.fail_ids.contains(&id) {
                anyhow::bail!("cannot decode item {}", id);
            }
        }
        Ok(AnalyzerOutput::new(self.category, self.confidence, self.confidence))
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.instance_name = "verdict-test".to_string();
    config.alerts.evaluation_interval_ms = 3_600_000;
    config
}

fn build(config: EngineConfig, analyzers: Vec<Arc<Scripted>>) -> Engine {
    let mut builder = Engine::builder(config).probe(Arc::new(StaticProbe(Some(0.3))));
    for analyzer in analyzers {
        builder = builder.analyzer(analyzer as Arc<dyn Analyzer>);
    }
    builder.build().unwrap()
}

fn image(id: u64) -> FeaturePayload {
    FeaturePayload::new(json!({"media_type": "image", "id": id}))
}

#[tokio::test]
async fn test_predict_returns_bounded_confidence() {
    let engine = build(
        test_config(),
        vec![
            Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.7)),
            Arc::new(Scripted::new("watermark", AnalyzerKind::Watermark, "deepfake", 0.95)),
        ],
    );

    let result = engine.predict(image(1), PredictOptions::default()).await.unwrap();
    assert!(!result.category.is_empty());
    assert!((0.0..=1.0).contains(&result.confidence));
    assert!((0.0..=1.0).contains(&result.consensus));
    assert!((0.0..=1.0).contains(&result.quality));
    assert_eq!(result.contributing_analyzers.len(), 2);
}

#[tokio::test]
async fn test_repeated_predict_is_served_from_cache() {
    let analyzers: Vec<Arc<Scripted>> = vec![
        Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9)),
        Arc::new(Scripted::new("watermark", AnalyzerKind::Watermark, "authentic", 0.85)),
        Arc::new(Scripted::new("metadata", AnalyzerKind::Metadata, "authentic", 0.8)),
    ];
    let engine = build(test_config(), analyzers.clone());

    let first = engine
        .predict(
            FeaturePayload::new(json!({"media_type": "image", "luma": 0.5, "blocks": [1.0, 2.0]})),
            PredictOptions::default(),
        )
        .await
        .unwrap();
    assert!(!first.cache_hit);

    // same features, different key order and float jitter
    let second = engine
        .predict(
            FeaturePayload::new(json!({"blocks": [1.00000001, 2.0], "luma": 0.5, "media_type": "image"})),
            PredictOptions::default(),
        )
        .await
        .unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.category, first.category);
    assert_eq!(second.confidence, first.confidence);

    for analyzer in &analyzers {
        assert_eq!(analyzer.calls(), 1, "{} invoked more than once", analyzer.id);
    }
    assert_eq!(engine.health().cache.hits, 1);
}

#[tokio::test(start_paused = true)]
async fn test_analyzer_breaker_opens_and_recovers() {
    let mut config = test_config();
    config.breaker.failure_threshold = 5;
    config.breaker.recovery_interval_ms = 1_000;

    let steady = Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9));
    let flaky = Arc::new(Scripted::new("watermark", AnalyzerKind::Watermark, "authentic", 0.9).failing());
    let engine = build(config, vec![steady.clone(), flaky.clone()]);
    let options = PredictOptions::default().without_cache();

    for _ in 0..5 {
        let result = engine.predict(image(1), options.clone()).await.unwrap();
        assert_eq!(result.contributing_analyzers, vec!["pixel".to_string()]);
    }
    assert_eq!(flaky.calls(), 5);
    assert_eq!(engine.analyzer_breaker_state("watermark"), BreakerState::Open);

    // open: fails fast without invoking the analyzer
    engine.predict(image(1), options.clone()).await.unwrap();
    assert_eq!(flaky.calls(), 5);

    flaky.failing.store(false, Ordering::SeqCst);
    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert_eq!(engine.analyzer_breaker_state("watermark"), BreakerState::Open);

    // the next call is the half-open trial; its success closes the breaker
    let result = engine.predict(image(1), options).await.unwrap();
    assert_eq!(flaky.calls(), 6);
    assert_eq!(result.contributing_analyzers.len(), 2);
    assert_eq!(engine.analyzer_breaker_state("watermark"), BreakerState::Closed);
}

#[tokio::test]
async fn test_consensus_tracks_vote_concentration() {
    let unanimous: Vec<Arc<Scripted>> = ["a1", "a2", "a3", "a4", "a5"]
        .into_iter()
        .map(|id| Arc::new(Scripted::new(id, AnalyzerKind::Pixel, "authentic", 0.8)))
        .collect();
    let engine = build(test_config(), unanimous);
    let result = engine.predict(image(1), PredictOptions::default()).await.unwrap();
    assert!((result.consensus - 1.0).abs() < 1e-9);

    let split: Vec<Arc<Scripted>> = [
        ("b1", "authentic"),
        ("b2", "deepfake"),
        ("b3", "edited"),
        ("b4", "synthetic"),
        ("b5", "spliced"),
    ]
    .into_iter()
    .map(|(id, category)| Arc::new(Scripted::new(id, AnalyzerKind::Pixel, category, 0.8)))
    .collect();
    let engine = build(test_config(), split);
    let result = engine.predict(image(1), PredictOptions::default()).await.unwrap();
    assert!((result.consensus - 0.2).abs() < 1e-9);
    // ties break toward the lexicographically smaller category
    assert_eq!(result.category, "authentic");
}

#[tokio::test]
async fn test_batch_partial_failure() {
    let analyzer = Arc::new(
        Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9).failing_for(&[3, 7]),
    );
    let engine = build(test_config(), vec![analyzer]);

    let items: Vec<FeaturePayload> = (0..10).map(image).collect();
    let response = engine.predict_batch(items, BatchOptions::default()).await.unwrap();

    assert_eq!(response.results.len(), 10);
    let failed: Vec<usize> = response
        .results
        .iter()
        .filter(|r| r.is_error())
        .map(|r| r.index())
        .collect();
    assert_eq!(failed, vec![3, 7]);
    assert!((response.metrics.success_rate - 0.8).abs() < 1e-9);
    assert_eq!(response.metrics.total, 10);
    assert_eq!(response.metrics.failed, 2);

    for (index, outcome) in response.results.iter().enumerate() {
        assert_eq!(outcome.index(), index);
    }
    match &response.results[3] {
        ItemOutcome::Failed { error_kind, item, .. } => {
            assert_eq!(error_kind, "aggregation");
            assert_eq!(item.value()["id"], 3);
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_batch_rejects_malformed_input() {
    let engine = build(
        test_config(),
        vec![Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9))],
    );
    let err = engine.predict_batch(Vec::new(), BatchOptions::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[test]
fn test_lot_size_shrinks_under_high_latency() {
    let config = test_config().batch;
    let min = config.min_lot_size;
    let orchestrator = BatchOrchestrator::new(config);
    let signals = LoadSignals {
        p95_latency_ms: 2_000.0,
        in_flight: 0,
        memory_usage: Some(0.2),
        accelerated: false,
    };
    let size = orchestrator.lot_size(Some(32), 1_000, &signals);
    assert!(size < 32);
    assert!(size >= min);
}

#[tokio::test(start_paused = true)]
async fn test_confident_majority_is_boosted() {
    let engine = build(
        test_config(),
        vec![
            Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "autentica", 0.9)),
            Arc::new(Scripted::new("watermark", AnalyzerKind::Watermark, "autentica", 0.85)),
            Arc::new(Scripted::new("metadata", AnalyzerKind::Metadata, "ia", 0.4)),
        ],
    );

    let result = engine
        .predict(
            FeaturePayload::new(json!({"tipo": "imagen", "calidad": "alta"})),
            PredictOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.category, "autentica");
    assert!(result.confidence > (0.9 + 0.85) / 2.0);
    assert!(result.confidence <= 1.0);
    assert!(result.anomalies.is_empty());
    assert!(result.vote_shares["autentica"] > result.vote_shares["ia"]);
}

#[tokio::test(start_paused = true)]
async fn test_cached_result_expires_after_ttl() {
    let mut config = test_config();
    config.cache.ttl_ms = 1_000;
    let analyzer = Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9));
    let engine = build(config, vec![analyzer.clone()]);

    engine.predict(image(1), PredictOptions::default()).await.unwrap();
    assert!(engine.predict(image(1), PredictOptions::default()).await.unwrap().cache_hit);

    tokio::time::advance(Duration::from_millis(1_500)).await;
    let result = engine.predict(image(1), PredictOptions::default()).await.unwrap();
    assert!(!result.cache_hit);
    assert_eq!(analyzer.calls(), 2);
}

#[tokio::test]
async fn test_low_confidence_results_are_not_cached() {
    let analyzer = Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.3));
    let engine = build(test_config(), vec![analyzer.clone()]);

    engine.predict(image(1), PredictOptions::default()).await.unwrap();
    let again = engine.predict(image(1), PredictOptions::default()).await.unwrap();
    assert!(!again.cache_hit);
    assert_eq!(analyzer.calls(), 2);
}

#[tokio::test]
async fn test_rate_limit_per_caller() {
    let mut config = test_config();
    config.rate_limit.max_requests = 2;
    let engine = build(
        config,
        vec![Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9))],
    );
    let studio = PredictOptions::default().with_caller("studio-a");

    assert_ok!(engine.predict(image(1), studio.clone()).await);
    assert_ok!(engine.predict(image(2), studio.clone()).await);
    let err = assert_err!(engine.predict(image(3), studio).await);
    assert!(matches!(err, EngineError::RateLimited { ref caller, limit: 2, .. } if caller == "studio-a"));
    assert!(err.is_retryable());
    assert!(err.retry_after().is_some());

    assert_ok!(
        engine
            .predict(image(3), PredictOptions::default().with_caller("studio-b"))
            .await
    );
    assert_eq!(engine.metrics().errors_by_kind.get("rate_limit"), Some(&1));
}

#[tokio::test]
async fn test_invalid_features_are_rejected() {
    let mut config = test_config();
    config.request.max_depth = 3;
    let analyzer = Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9));
    let engine = build(config, vec![analyzer.clone()]);

    let scalar = engine.predict(FeaturePayload::new(json!(42)), PredictOptions::default()).await;
    assert!(matches!(scalar, Err(EngineError::Validation(_))));

    let deep = FeaturePayload::new(json!({"a": {"b": {"c": {"d": 1}}}}));
    let deep = engine.predict(deep, PredictOptions::default()).await;
    assert!(matches!(deep, Err(EngineError::Validation(_))));
    assert_eq!(analyzer.calls(), 0);
}

#[tokio::test]
async fn test_invalid_analyzer_output_is_excluded() {
    struct OutOfRange;

    #[async_trait]
    impl Analyzer for OutOfRange {
        fn id(&self) -> &str {
            "provenance"
        }

        fn kind(&self) -> AnalyzerKind {
            AnalyzerKind::Provenance
        }

        async fn analyze(&self, _features: &FeaturePayload) -> anyhow::Result<AnalyzerOutput> {
            Ok(AnalyzerOutput::new("authentic", 1.7, 0.2))
        }
    }

    let engine = Engine::builder(test_config())
        .probe(Arc::new(StaticProbe(None)))
        .analyzer(Arc::new(OutOfRange))
        .analyzer(Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "edited", 0.9)))
        .build()
        .unwrap();

    let result = engine.predict(image(1), PredictOptions::default()).await.unwrap();
    assert_eq!(result.category, "edited");
    assert_eq!(result.contributing_analyzers, vec!["pixel".to_string()]);
}

#[tokio::test]
async fn test_all_analyzers_failing_is_an_aggregation_error() {
    let engine = build(
        test_config(),
        vec![Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9).failing())],
    );
    let err = engine.predict(image(1), PredictOptions::default()).await.unwrap_err();
    match err {
        EngineError::Aggregation { attempted, failed, .. } => {
            assert_eq!(attempted, 1);
            assert_eq!(failed, 1);
        }
        other => panic!("expected aggregation error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_isolated_analyzers_surface_circuit_open() {
    let mut config = test_config();
    config.breaker.failure_threshold = 1;
    let engine = build(
        config,
        vec![Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9).failing())],
    );
    let options = PredictOptions::default().without_cache();

    assert!(matches!(
        engine.predict(image(1), options.clone()).await,
        Err(EngineError::Aggregation { .. })
    ));
    let err = engine.predict(image(1), options).await.unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen { ref breaker, .. } if breaker == "pixel"));
}

#[tokio::test]
async fn test_system_breaker_short_circuits_requests() {
    let mut config = test_config();
    config.system_breaker.failure_threshold = 2;
    config.breaker.failure_threshold = 100;
    let engine = build(
        config,
        vec![Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9).failing())],
    );
    let options = PredictOptions::default().without_cache();

    for _ in 0..2 {
        assert!(engine.predict(image(1), options.clone()).await.is_err());
    }
    let err = engine.predict(image(1), options).await.unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen { ref breaker, .. } if breaker == "system"));
    assert!(!engine.readiness().ready);

    let health = engine.health();
    assert_eq!(health.system_breaker.state, BreakerState::Open);
    assert_eq!(health.components[components::SYSTEM_BREAKER].status, ComponentStatus::Unhealthy);
    assert!(health.score < 80);
}

#[tokio::test(start_paused = true)]
async fn test_request_deadline_is_enforced() {
    let mut config = test_config();
    config.request.request_timeout_ms = 100;
    config.request.analyzer_timeout_ms = 1_000;
    let engine = build(
        config,
        vec![Arc::new(
            Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9).slow(Duration::from_millis(500)),
        )],
    );

    let err = engine.predict(image(1), PredictOptions::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout { .. }));
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn test_fresh_engine_is_healthy() {
    let engine = build(
        test_config(),
        vec![
            Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9)),
            Arc::new(Scripted::new("temporal", AnalyzerKind::Temporal, "authentic", 0.9)),
        ],
    );
    let health = engine.health();
    assert_eq!(health.score, 100);
    assert_eq!(health.status, ComponentStatus::Healthy);
    assert!(health.accepting);
    assert_eq!(health.analyzers.len(), 2);
    assert_eq!(health.analyzer_breakers.len(), 2);
    assert!(engine.readiness().ready);
}

#[tokio::test]
async fn test_invalidate_cache() {
    let engine = build(
        test_config(),
        vec![Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9))],
    );
    engine.predict(image(1), PredictOptions::default()).await.unwrap();
    engine.predict(image(2), PredictOptions::default()).await.unwrap();
    assert_eq!(engine.health().cache.entries, 2);

    let none_match = |r: &verdict_engine::EnsembleResult| r.category == "deepfake";
    assert_eq!(engine.invalidate_cache(Some(&none_match)), 0);
    assert_eq!(engine.invalidate_cache(None), 2);
    assert_eq!(engine.health().cache.entries, 0);
}

#[tokio::test]
async fn test_metrics_are_exposed() {
    let engine = build(
        test_config(),
        vec![Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9))],
    );
    engine.predict(image(1), PredictOptions::default()).await.unwrap();
    engine.predict(image(1), PredictOptions::default()).await.unwrap();

    let summary = engine.metrics();
    assert_eq!(summary.predictions, 2);
    assert_eq!(summary.cache.hits, 1);
    assert_eq!(summary.cache.misses, 1);

    let text = engine.render_metrics().unwrap();
    assert!(text.contains("verdict_predictions_total 2"));
    assert!(text.contains("verdict_cache_events_total{event=\"hit\"} 1"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_stragglers() {
    let engine = build(
        test_config(),
        vec![Arc::new(
            Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.95).slow(Duration::from_secs(1)),
        )],
    );

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.predict(image(1), PredictOptions::default()).await })
    };
    for _ in 0..100 {
        if engine.health().in_flight > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(engine.health().in_flight, 1);

    let report = engine.shutdown(Duration::from_millis(100)).await;
    assert!(!report.drained);
    assert_eq!(report.pending_abandoned, 1);

    assert_eq!(engine.health().cache.entries, 0);

    // the analyzer still succeeds after the deadline; its verdict must not reach the cache
    assert!(matches!(pending.await.unwrap(), Err(EngineError::ShuttingDown)));
    assert_eq!(engine.health().cache.entries, 0);
    assert!(matches!(
        engine.predict(image(2), PredictOptions::default()).await,
        Err(EngineError::ShuttingDown)
    ));
    assert!(!engine.readiness().ready);

    let again = engine.shutdown(Duration::from_millis(100)).await;
    assert!(again.drained);
    assert_eq!(again.pending_abandoned, 0);
}

#[tokio::test]
async fn test_idle_shutdown_drains_cleanly() {
    let engine = build(
        test_config(),
        vec![Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "authentic", 0.9))],
    );
    engine.predict(image(1), PredictOptions::default()).await.unwrap();

    let report = engine.shutdown(Duration::from_secs(1)).await;
    assert!(report.drained);
    assert_eq!(report.pending_abandoned, 0);
    assert_eq!(engine.health().cache.entries, 0);
    assert_eq!(
        engine.health().components[components::LIFECYCLE].status,
        ComponentStatus::Unhealthy
    );
}

#[tokio::test]
async fn test_builder_rejects_bad_setups() {
    let duplicate = Engine::builder(test_config())
        .analyzer(Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "a", 0.9)))
        .analyzer(Arc::new(Scripted::new("pixel", AnalyzerKind::Watermark, "a", 0.9)))
        .build();
    assert!(matches!(duplicate, Err(EngineError::Config(_))));

    assert!(matches!(Engine::builder(test_config()).build(), Err(EngineError::Config(_))));

    let mut config = test_config();
    config.batch.min_lot_size = 0;
    let invalid = Engine::builder(config)
        .analyzer(Arc::new(Scripted::new("pixel", AnalyzerKind::Pixel, "a", 0.9)))
        .build();
    assert!(matches!(invalid, Err(EngineError::Config(_))));
}
