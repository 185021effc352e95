//! Acknowledgement latency histogram.

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Width of one histogram window. A summary covers the current window and
/// the one before it, so old samples age out after two windows.
pub const DEFAULT_LATENCY_WINDOW: Duration = Duration::from_secs(60);

/// Largest trackable latency: one hour in microseconds.
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// Public latency summary in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub mean: f64,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
}

/// Histogram of recent latencies that forgets samples older than two windows.
#[derive(Debug, Clone)]
pub struct DecayingHistogram {
    current: Histogram<u64>,
    previous: Histogram<u64>,
    window: Duration,
    window_started: Instant,
}

fn empty_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, MAX_LATENCY_US, 3).expect("constant histogram bounds are valid")
}

impl DecayingHistogram {
    pub fn new(window: Duration) -> Self {
        Self {
            current: empty_histogram(),
            previous: empty_histogram(),
            window,
            window_started: Instant::now(),
        }
    }

    /// Record one latency sample in microseconds.
    pub fn update(&mut self, latency_us: u64) {
        self.update_at(latency_us, Instant::now());
    }

    fn update_at(&mut self, latency_us: u64, now: Instant) {
        self.rotate(now);
        self.current.saturating_record(latency_us.max(1));
    }

    fn rotate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_started);
        if elapsed < self.window {
            return;
        }
        if elapsed < self.window * 2 {
            std::mem::swap(&mut self.previous, &mut self.current);
            self.current.reset();
        } else {
            // Idle for more than two windows: everything is stale.
            self.previous.reset();
            self.current.reset();
        }
        self.window_started = now;
    }

    /// Summarize without modifying the recorded samples.
    pub fn summarize(&self) -> HistogramSummary {
        let mut merged = self.previous.clone();
        if merged.add(&self.current).is_err() {
            merged = self.current.clone();
        }
        if merged.is_empty() {
            return HistogramSummary::default();
        }

        HistogramSummary {
            count: merged.len(),
            mean: merged.mean(),
            min: merged.min(),
            max: merged.max(),
            p50: merged.value_at_quantile(0.50),
            p90: merged.value_at_quantile(0.90),
            p99: merged.value_at_quantile(0.99),
            p999: merged.value_at_quantile(0.999),
        }
    }
}

impl Default for DecayingHistogram {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}
