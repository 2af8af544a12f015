//! Self-observability primitives for the farsight backend.
//!
//! The persistence pipeline reports its own health through a small set of
//! counters and latency histograms. This crate provides those handles, a
//! registry that interns them by name, snapshot types for programmatic
//! inspection, and Prometheus text exposition.
//!
//! Histograms hand out [`HistogramTimer`] guards: the sample is recorded when
//! the guard is dropped, so every exit path of the timed scope (early return,
//! error, panic unwind) produces exactly one observation.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Upper bounds (seconds) used for latency histograms unless overridden.
pub const DEFAULT_LATENCY_BOUNDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Monotonically increasing counter.
pub struct Counter {
    name: String,
    help: String,
    value: AtomicU64,
}

impl Counter {
    fn new(name: &str, help: &str) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_by(&self, delta: u64) {
        if delta > 0 {
            self.value.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket latency histogram with cumulative-bucket exposition.
pub struct Histogram {
    name: String,
    help: String,
    /// Finite upper bounds; the implicit final bucket is +Inf.
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(name: &str, help: &str, bounds: &[f64]) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            name: name.to_string(),
            help: help.to_string(),
            bounds: bounds.to_vec(),
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one observation, in seconds.
    pub fn observe(&self, seconds: f64) {
        let seconds = if seconds.is_finite() && seconds >= 0.0 {
            seconds
        } else {
            0.0
        };
        let slot = self
            .bounds
            .iter()
            .position(|bound| seconds <= *bound)
            .unwrap_or(self.bounds.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Start a scoped timer; the elapsed time is recorded when the returned
    /// guard is dropped.
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            started: Instant::now(),
            observed: false,
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    fn snapshot(&self) -> HistogramSample {
        let mut cumulative = 0u64;
        let mut buckets = Vec::with_capacity(self.buckets.len());
        for (slot, counter) in self.buckets.iter().enumerate() {
            cumulative += counter.load(Ordering::Relaxed);
            let upper_bound = self.bounds.get(slot).copied().unwrap_or(f64::INFINITY);
            buckets.push(HistogramBucket {
                upper_bound,
                count: cumulative,
            });
        }
        HistogramSample {
            name: self.name.clone(),
            buckets,
            sum_seconds: self.sum_seconds(),
            count: self.sample_count(),
        }
    }
}

/// RAII guard recording elapsed seconds into its histogram on drop.
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    started: Instant,
    observed: bool,
}

impl HistogramTimer<'_> {
    /// Record now and consume the guard.
    pub fn stop(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if !self.observed {
            self.observed = true;
            self.histogram.observe(self.started.elapsed().as_secs_f64());
        }
    }
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        self.record();
    }
}

/// Point-in-time view of a counter.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSample {
    pub name: String,
    pub value: u64,
}

/// One cumulative histogram bucket.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HistogramBucket {
    pub upper_bound: f64,
    pub count: u64,
}

/// Point-in-time view of a histogram.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSample {
    pub name: String,
    pub buckets: Vec<HistogramBucket>,
    pub sum_seconds: f64,
    pub count: u64,
}

/// Snapshot of every metric known to a [`MetricsRegistry`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<CounterSample>,
    pub histograms: Vec<HistogramSample>,
}

/// Creates and interns metric handles by name.
///
/// Creating a metric under an already-registered name returns the existing
/// handle, so components may re-resolve their metrics without losing
/// accumulated samples.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<String, Arc<Counter>>>,
    histograms: Mutex<BTreeMap<String, Arc<Histogram>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_counter(&self, name: &str, help: &str) -> Arc<Counter> {
        let mut counters = self.counters.lock();
        Arc::clone(
            counters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Counter::new(name, help))),
        )
    }

    pub fn create_histogram(&self, name: &str, help: &str) -> Arc<Histogram> {
        self.create_histogram_with_bounds(name, help, DEFAULT_LATENCY_BOUNDS)
    }

    pub fn create_histogram_with_bounds(
        &self,
        name: &str,
        help: &str,
        bounds: &[f64],
    ) -> Arc<Histogram> {
        let mut histograms = self.histograms.lock();
        Arc::clone(
            histograms
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Histogram::new(name, help, bounds))),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .lock()
            .values()
            .map(|counter| CounterSample {
                name: counter.name.clone(),
                value: counter.value(),
            })
            .collect();
        let histograms = self
            .histograms
            .lock()
            .values()
            .map(|histogram| histogram.snapshot())
            .collect();
        MetricsSnapshot {
            counters,
            histograms,
        }
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn expose_text(&self) -> String {
        let mut buffer = String::new();
        for counter in self.counters.lock().values() {
            let _ = writeln!(buffer, "# HELP {} {}", counter.name, counter.help);
            let _ = writeln!(buffer, "# TYPE {} counter", counter.name);
            let _ = writeln!(buffer, "{} {}", counter.name, counter.value());
        }
        for histogram in self.histograms.lock().values() {
            let _ = writeln!(buffer, "# HELP {} {}", histogram.name, histogram.help);
            let _ = writeln!(buffer, "# TYPE {} histogram", histogram.name);
            let sample = histogram.snapshot();
            for bucket in &sample.buckets {
                if bucket.upper_bound.is_infinite() {
                    let _ = writeln!(
                        buffer,
                        "{}_bucket{{le=\"+Inf\"}} {}",
                        histogram.name, bucket.count
                    );
                } else {
                    let _ = writeln!(
                        buffer,
                        "{}_bucket{{le=\"{}\"}} {}",
                        histogram.name, bucket.upper_bound, bucket.count
                    );
                }
            }
            let _ = writeln!(buffer, "{}_sum {}", histogram.name, sample.sum_seconds);
            let _ = writeln!(buffer, "{}_count {}", histogram.name, sample.count);
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn counter_increments() {
        let registry = MetricsRegistry::new();
        let counter = registry.create_counter("ticks_total", "Ticks executed");
        counter.inc();
        counter.inc_by(4);
        counter.inc_by(0);
        assert_eq!(counter.value(), 5);
    }

    #[test]
    fn registry_interns_by_name() {
        let registry = MetricsRegistry::new();
        let first = registry.create_counter("errors", "Errors");
        first.inc();
        let second = registry.create_counter("errors", "Errors");
        assert_eq!(second.value(), 1);
        assert!(Arc::ptr_eq(&first, &second));

        let h1 = registry.create_histogram("latency", "Latency");
        let h2 = registry.create_histogram("latency", "Latency");
        assert!(Arc::ptr_eq(&h1, &h2));
    }

    #[test]
    fn observations_land_in_the_right_bucket() {
        let registry = MetricsRegistry::new();
        let histogram =
            registry.create_histogram_with_bounds("latency", "Latency", &[0.1, 1.0]);
        histogram.observe(0.05);
        histogram.observe(0.5);
        histogram.observe(30.0);

        let sample = histogram.snapshot();
        assert_eq!(sample.count, 3);
        assert_eq!(sample.buckets.len(), 3);
        // Cumulative counts: <=0.1 holds one, <=1.0 holds two, +Inf all three.
        assert_eq!(sample.buckets[0].count, 1);
        assert_eq!(sample.buckets[1].count, 2);
        assert_eq!(sample.buckets[2].count, 3);
        assert!(sample.buckets[2].upper_bound.is_infinite());
    }

    #[test]
    fn timer_records_once_on_drop() {
        let registry = MetricsRegistry::new();
        let histogram = registry.create_histogram("latency", "Latency");
        {
            let _timer = histogram.start_timer();
        }
        assert_eq!(histogram.sample_count(), 1);

        let timer = histogram.start_timer();
        timer.stop();
        assert_eq!(histogram.sample_count(), 2);
    }

    #[test]
    fn timer_records_when_scope_panics() {
        let registry = MetricsRegistry::new();
        let histogram = registry.create_histogram("latency", "Latency");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _timer = histogram.start_timer();
            panic!("boom");
        }));
        assert!(outcome.is_err());
        assert_eq!(histogram.sample_count(), 1);
    }

    #[test]
    fn exposition_contains_counters_and_histograms() {
        let registry = MetricsRegistry::new();
        registry
            .create_counter("persistence_timer_bulk_error_count", "Errors")
            .inc();
        let histogram =
            registry.create_histogram("persistence_timer_bulk_all_latency", "All-stage latency");
        histogram.observe(0.02);

        let text = registry.expose_text();
        assert!(text.contains("# TYPE persistence_timer_bulk_error_count counter"));
        assert!(text.contains("persistence_timer_bulk_error_count 1"));
        assert!(text.contains("# TYPE persistence_timer_bulk_all_latency histogram"));
        assert!(text.contains("persistence_timer_bulk_all_latency_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("persistence_timer_bulk_all_latency_count 1"));
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let registry = MetricsRegistry::new();
        registry.create_counter("flushes_total", "Flushes").inc();
        let json = serde_json::to_string(&registry.snapshot()).expect("serialize snapshot");
        assert!(json.contains("flushes_total"));
    }
}
