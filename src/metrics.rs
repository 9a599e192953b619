//! Observability: per-render trace IDs, histogram metrics, outcome counters.
//! Every render carries a trace_id and its generation.
//! Histograms track p50/p95/p99 for all timing points.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Identifiers attached to every render attempt, for correlating logs across threads.
#[derive(Debug, Clone)]
pub struct RenderIds {
    pub trace_id: String,
    pub generation: u64,
}

impl RenderIds {
    pub fn new(generation: u64) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            generation,
        }
    }
}

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

    /// Elapsed so far without finishing.
    pub fn elapsed_us(&self) -> f64 {
        self.start.elapsed().as_micros() as f64
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

/// Stores histograms for timing metrics and counters for render outcomes.
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
        Self::with_capacity(1024)
    }

    pub fn with_capacity(ring_capacity: usize) -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
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
        tracing::trace!(metric = name, value_us = value_us, "metric_recorded");
    }

    pub fn increment(&self, name: &'static str) {
        *self.counters.lock().entry(name).or_insert(0) += 1;
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
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

    /// Generate a summary of all timing metrics at p50/p95/p99.
    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let hists = self.histograms.lock();
        let mut out = HashMap::new();
        for (&name, ring) in hists.iter() {
            out.insert(
                name.to_string(),
                MetricSummary {
                    p50_us: ring.percentile(50.0),
                    p95_us: ring.percentile(95.0),
                    p99_us: ring.percentile(99.0),
                    count: ring.count,
                },
            );
        }
        out
    }

    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .iter()
            .map(|(&name, &value)| (name.to_string(), value))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Well-known metric names (constants to avoid typos).
pub mod metric_names {
    pub const QUEUE_WAIT: &str = "render_queue_wait";
    pub const PAINT: &str = "t_paint";
    pub const RENDER_DONE: &str = "t_render_done";
    pub const APPLY_WAIT: &str = "render_apply_wait";
    pub const SYNC_RENDER: &str = "t_sync_render";

    pub const COMPLETED: &str = "renders_completed";
    pub const CANCELLED: &str = "renders_cancelled";
    pub const DEGENERATE: &str = "renders_degenerate";
    pub const EMPTY_TASK: &str = "renders_empty_task";
    pub const MISSING_CANVAS: &str = "renders_missing_canvas";
    pub const PAINT_FAILED: &str = "renders_paint_failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::PAINT, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::PAINT, 0.0), 1.0);
        assert_eq!(registry.percentile(metric_names::PAINT, 100.0), 100.0);
        let p50 = registry.percentile(metric_names::PAINT, 50.0);
        assert!((50.0..=51.0).contains(&p50));
        assert_eq!(registry.percentile("unknown", 50.0), 0.0);
    }

    #[test]
    fn ring_keeps_most_recent_samples() {
        let registry = MetricsRegistry::with_capacity(4);
        for v in [100.0, 100.0, 1.0, 2.0, 3.0, 4.0] {
            registry.record(metric_names::QUEUE_WAIT, v);
        }
        let summary = registry.summary();
        let wait = &summary[metric_names::QUEUE_WAIT];
        assert_eq!(wait.count, 4);
        assert_eq!(registry.percentile(metric_names::QUEUE_WAIT, 100.0), 4.0);
    }

    #[test]
    fn counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.increment(metric_names::CANCELLED);
        registry.increment(metric_names::CANCELLED);
        registry.increment(metric_names::COMPLETED);
        assert_eq!(registry.count(metric_names::CANCELLED), 2);
        assert_eq!(registry.count(metric_names::COMPLETED), 1);
        assert_eq!(registry.count(metric_names::DEGENERATE), 0);
        assert_eq!(registry.counters().len(), 2);
    }

    #[test]
    fn span_records_on_finish() {
        let registry = Arc::new(MetricsRegistry::new());
        let span = registry.span(metric_names::RENDER_DONE);
        span.finish();
        assert_eq!(registry.summary()[metric_names::RENDER_DONE].count, 1);
    }

    #[test]
    fn render_ids_are_unique() {
        let a = RenderIds::new(1);
        let b = RenderIds::new(1);
        assert_ne!(a.trace_id, b.trace_id);
        assert_eq!(a.generation, 1);
    }
}
