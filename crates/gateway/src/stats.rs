//! Request-latency statistics for the health summary.
//!
//! A bounded ring of recent end-to-end latencies (request arrival to
//! the stream's `done`). Mean and p95 are computed over the ring, the
//! count over the process lifetime.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

const RING_CAPACITY: usize = 256;

#[derive(Default)]
pub struct LatencyStats {
    samples: Mutex<VecDeque<u64>>,
    total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    /// Completed requests since startup.
    pub count: u64,
    /// Mean latency over the recent window, in milliseconds.
    pub mean_ms: f64,
    /// 95th percentile over the recent window, in milliseconds.
    pub p95_ms: u64,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut samples = self
            .samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if samples.len() == RING_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    pub fn summary(&self) -> LatencySummary {
        let samples = self
            .samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = self.total.load(Ordering::Relaxed);
        if samples.is_empty() {
            return LatencySummary {
                count,
                mean_ms: 0.0,
                p95_ms: 0,
            };
        }

        let sum: u64 = samples.iter().sum();
        let mean_ms = sum as f64 / samples.len() as f64;

        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        let p95_ms = sorted[idx.min(sorted.len()) - 1];

        LatencySummary {
            count,
            mean_ms,
            p95_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_summary_is_zero() {
        let stats = LatencyStats::new();
        let summary = stats.summary();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.mean_ms, 0.0);
    }

    #[test]
    fn mean_and_p95() {
        let stats = LatencyStats::new();
        for ms in 1..=100 {
            stats.record(ms);
        }
        let summary = stats.summary();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.mean_ms, 50.5);
        assert_eq!(summary.p95_ms, 95);
    }

    #[test]
    fn ring_keeps_recent_window_but_counts_everything() {
        let stats = LatencyStats::new();
        for _ in 0..500 {
            stats.record(10);
        }
        let summary = stats.summary();
        assert_eq!(summary.count, 500);
        assert_eq!(summary.mean_ms, 10.0);
    }
}
