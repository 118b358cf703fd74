//! Latency histograms for cache and warmup operations.
//! Histograms track p50/p95/p99 for every named timing point.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_RING_CAPACITY: usize = 1024;

/// A span measuring elapsed time from creation to explicit end.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn new(name: &'static str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            name,
            start: Instant::now(),
            registry,
        }
    }

    /// End the span, recording elapsed duration in microseconds.
    pub fn finish(self) -> f64 {
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
        elapsed_us
    }
}

/// Fixed-capacity ring buffer for histogram samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        let idx = idx.min(self.count - 1);
        sorted[idx]
    }
}

/// Stores histograms for all named metrics.
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    /// Keep at most `ring_capacity` recent samples per metric.
    pub fn with_capacity(ring_capacity: usize) -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            ring_capacity: ring_capacity.max(1),
        }
    }

    /// Record a sample (in microseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_us: f64) {
        let mut hists = self.histograms.lock();
        hists
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_us);
        tracing::trace!(metric = name, value_us, "metric recorded");
    }

    /// Start a timing span that records on finish.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan::new(name, Arc::clone(self))
    }

    /// Get percentile for a metric (p value 0-100). Returns microseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        let hists = self.histograms.lock();
        hists
            .get(name)
            .map(|ring| ring.percentile(p))
            .unwrap_or(0.0)
    }

    /// p50/p95/p99 for every metric with samples, ordered by name.
    pub fn summary(&self) -> BTreeMap<&'static str, MetricSummary> {
        self.histograms
            .lock()
            .iter()
            .map(|(&name, ring)| {
                let summary = MetricSummary {
                    p50_us: ring.percentile(50.0),
                    p95_us: ring.percentile(95.0),
                    p99_us: ring.percentile(99.0),
                    count: ring.count,
                };
                (name, summary)
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Metric names recorded by this crate.
pub mod metric_names {
    pub const CACHE_GET: &str = "cache_get";
    pub const CACHE_PUT: &str = "cache_put";
    pub const PRUNE_PASS: &str = "prune_pass";
    pub const SYNTHESIZE: &str = "synthesize";
    pub const WARMUP_TASK: &str = "warmup_task";
    pub const EXPORT: &str = "export";
    pub const IMPORT: &str = "import";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_recorded_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::CACHE_GET, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::CACHE_GET, 50.0), 51.0);
        assert_eq!(registry.percentile(metric_names::CACHE_GET, 99.0), 99.0);
        assert_eq!(registry.percentile(metric_names::CACHE_PUT, 50.0), 0.0);
        assert_eq!(registry.summary()[metric_names::CACHE_GET].count, 100);
    }

    #[test]
    fn ring_keeps_only_latest_samples() {
        let registry = MetricsRegistry::with_capacity(4);
        for v in [100.0, 1.0, 2.0, 3.0, 4.0] {
            registry.record(metric_names::PRUNE_PASS, v);
        }
        let summary = registry.summary();
        assert_eq!(summary[metric_names::PRUNE_PASS].count, 4);
        assert_eq!(registry.percentile(metric_names::PRUNE_PASS, 100.0), 4.0);
    }
}
