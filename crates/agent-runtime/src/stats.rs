//! Shared atomic counter helpers
//!
//! Every component keeps its counters as atomics and exposes value snapshots,
//! never live references. Averages are derived from a running nanosecond
//! total and a sample count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running average over durations, updated lock-free
#[derive(Debug, Default)]
pub(crate) struct AtomicAverage {
    total_ns: AtomicU64,
    samples: AtomicU64,
}

impl AtomicAverage {
    pub(crate) fn record(&self, sample: Duration) {
        self.total_ns
            .fetch_add(sample.as_nanos() as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub(crate) fn average(&self) -> Duration {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed) / samples)
    }
}

/// Percentage of `part` in `whole`, 0.0 when the denominator is zero
pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}
