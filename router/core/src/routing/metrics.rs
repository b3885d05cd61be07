//! Router Metrics
//!
//! Lock-free counters and a bucketed latency histogram, plus per-model
//! counters keyed in a `DashMap`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::cache::TierKind;

// ============================================================================
// Histogram
// ============================================================================

/// Bucketed distribution of values
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram with the given ascending bucket bounds
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Millisecond latency buckets
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
            30000.0, 60000.0, 120000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        let Some(last) = self.buckets.len().checked_sub(1) else {
            return;
        };
        let bucket = self.buckets.iter().position(|&b| value <= b).unwrap_or(last);
        self.counts[bucket].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.max.fetch_max(value as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            total,
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 { sum as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Copy of a [`Histogram`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// Upper bucket bounds
    pub buckets: Vec<f64>,
    /// Values per bucket
    pub counts: Vec<u64>,
    /// Values recorded
    pub total: u64,
    /// Largest value
    pub max: u64,
    /// Mean value
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }
        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// Median
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// 99th percentile
    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// Monotonic atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-model
// ============================================================================

/// Counters for one model
#[derive(Debug, Default)]
pub struct ModelMetrics {
    /// Attempts sent to the model
    pub attempts: Counter,
    /// Attempts that succeeded
    pub successes: Counter,
    /// Attempts that failed
    pub failures: Counter,
    /// Attempts that timed out
    pub timeouts: Counter,
}

/// Copy of [`ModelMetrics`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelMetricsSummary {
    /// Model id
    pub model_id: String,
    /// Attempts sent to the model
    pub attempts: u64,
    /// Attempts that succeeded
    pub successes: u64,
    /// Attempts that failed
    pub failures: u64,
    /// Attempts that timed out
    pub timeouts: u64,
}

// ============================================================================
// Router-wide
// ============================================================================

/// Request path counters
#[derive(Debug)]
pub struct RouterMetrics {
    /// Requests submitted
    pub requests: Counter,
    /// Hits per tier, Hot first
    pub cache_hits: [Counter; 3],
    /// Requests that reached a backend call
    pub cache_misses: Counter,
    /// Requests that joined another caller's in-flight call
    pub dedup_joins: Counter,
    /// Fallback attempts made
    pub fallbacks: Counter,
    /// Requests with no viable model
    pub routing_errors: Counter,
    /// Requests whose whole chain failed
    pub exhausted_chains: Counter,
    /// Requests refused for lack of memory
    pub resource_exhausted: Counter,
    /// End-to-end latency in milliseconds
    pub latency_ms: Histogram,
    models: DashMap<String, Arc<ModelMetrics>>,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self {
            requests: Counter::default(),
            cache_hits: Default::default(),
            cache_misses: Counter::default(),
            dedup_joins: Counter::default(),
            fallbacks: Counter::default(),
            routing_errors: Counter::default(),
            exhausted_chains: Counter::default(),
            resource_exhausted: Counter::default(),
            latency_ms: Histogram::latency_default(),
            models: DashMap::new(),
        }
    }
}

impl RouterMetrics {
    /// Counters for `model_id`, created on first use
    pub fn model(&self, model_id: &str) -> Arc<ModelMetrics> {
        if let Some(existing) = self.models.get(model_id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.models
                .entry(model_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Record a cache hit
    pub fn record_hit(&self, tier: TierKind) {
        let index = match tier {
            TierKind::Hot => 0,
            TierKind::Warm => 1,
            TierKind::Cold => 2,
        };
        self.cache_hits[index].inc();
    }

    /// Per-model counters, sorted by model id
    #[must_use]
    pub fn model_summaries(&self) -> Vec<ModelMetricsSummary> {
        let mut summaries: Vec<_> = self
            .models
            .iter()
            .map(|entry| ModelMetricsSummary {
                model_id: entry.key().clone(),
                attempts: entry.attempts.get(),
                successes: entry.successes.get(),
                failures: entry.failures.get(),
                timeouts: entry.timeouts.get(),
            })
            .collect();
        summaries.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        summaries
    }
}
