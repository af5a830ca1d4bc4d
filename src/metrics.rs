//! Observability: histogram metrics, counters and timing spans.
//! Histograms track p50/p95/p99 for the engine's timing points; counters
//! track API calls, cache hits and failures.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

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
        sorted[idx.min(self.count - 1)]
    }
}

pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    counters: Mutex<HashMap<&'static str, u64>>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            ring_capacity: 1024,
        }
    }

    /// Record a sample (in microseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_us: f64) {
        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_us);
        tracing::trace!(metric = name, value_us, "metric_recorded");
    }

    pub fn increment(&self, name: &'static str, by: u64) {
        *self.counters.lock().entry(name).or_insert(0) += by;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Start a timing span that records on finish.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan::new(name, Arc::clone(self))
    }

    /// Percentile (p in 0-100) for a metric, in microseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map(|ring| ring.percentile(p))
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histograms = self
            .histograms
            .lock()
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_us: ring.percentile(50.0),
                        p95_us: ring.percentile(95.0),
                        p99_us: ring.percentile(99.0),
                        count: ring.count,
                    },
                )
            })
            .collect();
        let counters = self
            .counters
            .lock()
            .iter()
            .map(|(&name, &v)| (name.to_string(), v))
            .collect();
        MetricsSnapshot { histograms, counters }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub histograms: BTreeMap<String, MetricSummary>,
    pub counters: BTreeMap<String, u64>,
}

/// Well-known metric names (constants to avoid typos).
pub mod metric_names {
    pub const API_CALL: &str = "t_api_call";
    pub const UNIT_TRANSLATE: &str = "t_unit_translate";
    pub const POST_TRANSLATE: &str = "t_post_translate";
    pub const THROTTLE_WAIT: &str = "throttle_wait";
    pub const QUEUE_ITEM: &str = "t_queue_item";

    pub const API_CALLS: &str = "api_calls";
    pub const API_ERRORS: &str = "api_errors";
    pub const TOKENS_USED: &str = "tokens_used";
    pub const CACHE_HITS: &str = "cache_hits";
    pub const UNITS_FAILED: &str = "units_failed";
    pub const QUEUE_COMPLETED: &str = "queue_completed";
    pub const QUEUE_FAILED: &str = "queue_failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_over_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::API_CALL, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::API_CALL, 50.0), 51.0);
        assert_eq!(registry.percentile(metric_names::API_CALL, 99.0), 99.0);
        assert_eq!(registry.percentile("unknown", 50.0), 0.0);
    }

    #[test]
    fn test_ring_keeps_latest_samples() {
        let mut ring = SampleRing::new(4);
        for v in [100.0, 1.0, 2.0, 3.0, 4.0] {
            ring.push(v);
        }
        assert_eq!(ring.count, 4);
        assert_eq!(ring.percentile(100.0), 4.0);
    }

    #[test]
    fn test_counters_and_snapshot() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.increment(metric_names::API_CALLS, 2);
        registry.increment(metric_names::API_CALLS, 1);
        registry.span(metric_names::POST_TRANSLATE).finish();

        assert_eq!(registry.counter(metric_names::API_CALLS), 3);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counters["api_calls"], 3);
        assert_eq!(snapshot.histograms["t_post_translate"].count, 1);
    }
}
