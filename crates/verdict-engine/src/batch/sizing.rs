//! Adaptive lot sizing from live load

use crate::config::BatchConfig;
use serde::Serialize;

/// Lower bound on the latency correction factor
const MIN_LATENCY_FACTOR: f64 = 0.25;
const ACCELERATED_FACTOR: f64 = 1.5;
/// Memory usage below the pressure threshold at which shrinking starts
const MEMORY_EARLY_MARGIN: f64 = 0.10;

/// Load observed when a batch starts
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoadSignals {
    pub p95_latency_ms: f64,
    pub in_flight: usize,
    /// Used fraction of host memory, when known
    pub memory_usage: Option<f64>,
    pub accelerated: bool,
}

/// Individual correction factors, kept for logging
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizingFactors {
    pub latency: f64,
    pub load: f64,
    pub memory: f64,
    pub backend: f64,
}

impl SizingFactors {
    pub fn from_signals(signals: &LoadSignals, config: &BatchConfig) -> Self {
        let latency = if signals.p95_latency_ms > config.target_p95_ms && signals.p95_latency_ms > 0.0 {
            (config.target_p95_ms / signals.p95_latency_ms).clamp(MIN_LATENCY_FACTOR, 1.0)
        } else {
            1.0
        };

        let high = config.in_flight_high_watermark.max(1);
        let load = if signals.in_flight >= high {
            0.5
        } else if signals.in_flight >= high / 2 && signals.in_flight > 0 {
            0.75
        } else {
            1.0
        };

        let memory = match signals.memory_usage {
            Some(used) if used >= config.memory_pressure_threshold => 0.5,
            Some(used) if used >= config.memory_pressure_threshold - MEMORY_EARLY_MARGIN => 0.75,
            _ => 1.0,
        };

        let backend = if signals.accelerated { ACCELERATED_FACTOR } else { 1.0 };

        Self {
            latency,
            load,
            memory,
            backend,
        }
    }

    pub fn product(&self) -> f64 {
        self.latency * self.load * self.memory * self.backend
    }
}

/// Lot size for a batch of `items` items
///
/// Starts from the suggestion (or the configured default), applies the
/// load factors, clamps to the configured bounds and finally to the input
/// length.
pub fn adjusted_lot_size(
    suggested: Option<usize>,
    items: usize,
    signals: &LoadSignals,
    config: &BatchConfig,
) -> usize {
    let base = suggested.filter(|s| *s > 0).unwrap_or(config.default_lot_size);
    let factors = SizingFactors::from_signals(signals, config);
    let scaled = (base as f64 * factors.product()).floor() as usize;
    scaled
        .clamp(config.min_lot_size, config.max_lot_size)
        .min(items)
        .max(1)
}
