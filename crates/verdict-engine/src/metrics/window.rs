//! Time-bounded sample series

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Samples kept for a fixed trailing duration, capped in count
#[derive(Debug)]
pub struct SampleWindow<T> {
    samples: VecDeque<(Instant, T)>,
    window: Duration,
    max_samples: usize,
}

impl<T> SampleWindow<T> {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(1),
        }
    }

    pub fn push(&mut self, at: Instant, value: T) {
        self.prune(at);
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back((at, value));
    }

    /// Drop samples older than the window
    pub fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.samples.iter().map(|(_, v)| v)
    }

    /// Samples recorded within `within` of `now`
    pub fn since(&self, now: Instant, within: Duration) -> impl Iterator<Item = &T> {
        self.samples
            .iter()
            .rev()
            .take_while(move |(at, _)| now.saturating_duration_since(*at) <= within)
            .map(|(_, v)| v)
    }
}

/// Latency distribution over a window
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub max: f64,
}

impl Percentiles {
    /// Exact percentiles by sorting, nearest-rank method
    pub fn compute(values: impl Iterator<Item = f64>) -> Self {
        let mut sorted: Vec<f64> = values.filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        Self {
            p50: nearest_rank(&sorted, 50.0),
            p75: nearest_rank(&sorted, 75.0),
            p90: nearest_rank(&sorted, 90.0),
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
            mean,
            max: sorted[sorted.len() - 1],
        }
    }
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
