//! Windowed dispatch metrics.
//!
//! Sliding-window success/failure counts and processing-time percentiles per
//! worker pool, surfaced by the worker's stats endpoint. Prometheus-facing
//! counters and histograms are emitted inline by the pipeline via the
//! `metrics` facade; this collector exists for the operational snapshot.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Sample {
    timestamp: Instant,
    duration_ms: u64,
    success: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct LatencyMetrics {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetricsSnapshot {
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_rate_limited: u64,
    pub total_retried: u64,
    pub success_rate: f64,
    pub processing_time: LatencyMetrics,
    pub window_start: DateTime<Utc>,
}

const MAX_SAMPLES: usize = 10_000;
const WINDOW: Duration = Duration::from_secs(300);

pub struct DispatchMetricsCollector {
    total_delivered: AtomicU64,
    total_failed: AtomicU64,
    total_rate_limited: AtomicU64,
    total_retried: AtomicU64,
    samples: RwLock<VecDeque<Sample>>,
}

impl DispatchMetricsCollector {
    pub fn new() -> Self {
        Self {
            total_delivered: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_rate_limited: AtomicU64::new(0),
            total_retried: AtomicU64::new(0),
            samples: RwLock::new(VecDeque::with_capacity(1024)),
        }
    }

    pub fn record_delivered(&self, duration_ms: u64) {
        self.total_delivered.fetch_add(1, Ordering::Relaxed);
        self.add_sample(duration_ms, true);
    }

    pub fn record_failed(&self, duration_ms: u64) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        self.add_sample(duration_ms, false);
    }

    pub fn record_retried(&self) {
        self.total_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.total_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn add_sample(&self, duration_ms: u64, success: bool) {
        let mut samples = self.samples.write();

        let cutoff = Instant::now() - WINDOW;
        while samples.front().map(|s| s.timestamp < cutoff).unwrap_or(false) {
            samples.pop_front();
        }

        samples.push_back(Sample {
            timestamp: Instant::now(),
            duration_ms,
            success,
        });

        while samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
    }

    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        let samples = self.samples.read();

        let delivered = self.total_delivered.load(Ordering::Relaxed);
        let failed = self.total_failed.load(Ordering::Relaxed);
        let total = delivered + failed;
        let success_rate = if total > 0 {
            delivered as f64 / total as f64
        } else {
            1.0
        };

        let durations: Vec<u64> = samples.iter().map(|s| s.duration_ms).collect();

        DispatchMetricsSnapshot {
            total_delivered: delivered,
            total_failed: failed,
            total_rate_limited: self.total_rate_limited.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            success_rate,
            processing_time: latency_metrics(&durations),
            window_start: Utc::now() - chrono::Duration::seconds(WINDOW.as_secs() as i64),
        }
    }
}

impl Default for DispatchMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn latency_metrics(durations: &[u64]) -> LatencyMetrics {
    if durations.is_empty() {
        return LatencyMetrics::default();
    }

    let mut sorted: Vec<u64> = durations.to_vec();
    sorted.sort_unstable();

    let sum: u64 = sorted.iter().sum();
    let count = sorted.len() as u64;

    LatencyMetrics {
        avg_ms: sum as f64 / count as f64,
        min_ms: sorted[0],
        max_ms: sorted[sorted.len() - 1],
        p50_ms: percentile(&sorted, 50.0),
        p95_ms: percentile(&sorted, 95.0),
        p99_ms: percentile(&sorted, 99.0),
        sample_count: count,
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
