//! Metrics recorder for the courier bus.
//!
//! This module provides a small counters/gauges recorder with snapshot
//! export. Every recorded occurrence is:
//! - accumulated in-process (counters add, gauges replace-on-write),
//! - forwarded to an optional [`MetricSink`] callback, once per occurrence,
//! - mirrored to the `metrics` crate facade, so a host-installed recorder
//!   (e.g. a Prometheus exporter) sees the same series.
//!
//! A bus with no sink installed behaves identically to one with a sink;
//! [`NoopSink`] is a fully valid substitute.
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (e.g. `bus_`, `relay_`)
//! - Suffix: unit or type (e.g. `_total`, `_ms`)
//! - Labels: use sparingly to avoid cardinality explosion

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single countable occurrence, as delivered to a [`MetricSink`].
#[derive(Debug, Clone)]
pub struct MetricEvent {
    /// Metric name (static, snake_case).
    pub name: &'static str,
    /// Counter increment or gauge value.
    pub value: f64,
    /// Unix timestamp (seconds) when the occurrence was recorded.
    pub timestamp: u64,
    /// Optional labels attached to this occurrence.
    pub labels: Vec<(&'static str, &'static str)>,
}

/// Consumer of individual metric occurrences.
///
/// Fired once per countable occurrence, never batched. Implementations must
/// not block; they run on the bus's task.
pub trait MetricSink: Send + Sync {
    /// Receive one metric occurrence.
    fn record(&self, metric: &MetricEvent);
}

/// Sink that discards all occurrences.
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn record(&self, _metric: &MetricEvent) {}
}

/// Point-in-time copy of all counters and gauges.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Counter values by name.
    pub counters: HashMap<&'static str, u64>,
    /// Gauge values by name.
    pub gauges: HashMap<&'static str, f64>,
    /// Unix timestamp (seconds) the snapshot was taken.
    pub taken_at: u64,
}

/// Counters/gauges recorder with snapshot export.
pub struct MetricsRecorder {
    counters: Mutex<HashMap<&'static str, u64>>,
    gauges: Mutex<HashMap<&'static str, f64>>,
    sink: Option<Arc<dyn MetricSink>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    /// Create a recorder with no sink.
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    /// Create a recorder that forwards each occurrence to the given sink.
    pub fn with_sink(sink: Arc<dyn MetricSink>) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            sink: Some(sink),
        }
    }

    /// Increment a counter by one.
    pub fn incr(&self, name: &'static str) {
        self.incr_by(name, 1);
    }

    /// Increment a counter by an arbitrary amount.
    pub fn incr_by(&self, name: &'static str, amount: u64) {
        {
            let mut counters = self.counters.lock();
            *counters.entry(name).or_insert(0) += amount;
        }
        metrics::counter!(name).increment(amount);
        self.emit(name, amount as f64, Vec::new());
    }

    /// Increment a counter by one, attaching a single label.
    pub fn incr_labeled(&self, name: &'static str, key: &'static str, value: &'static str) {
        {
            let mut counters = self.counters.lock();
            *counters.entry(name).or_insert(0) += 1;
        }
        metrics::counter!(name, key => value).increment(1);
        self.emit(name, 1.0, vec![(key, value)]);
    }

    /// Set a gauge to a value, replacing the previous one.
    pub fn set_gauge(&self, name: &'static str, value: f64) {
        {
            let mut gauges = self.gauges.lock();
            gauges.insert(name, value);
        }
        metrics::gauge!(name).set(value);
        self.emit(name, value, Vec::new());
    }

    /// Take an immutable snapshot of all counters and gauges.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.lock().clone(),
            gauges: self.gauges.lock().clone(),
            taken_at: unix_now(),
        }
    }

    fn emit(&self, name: &'static str, value: f64, labels: Vec<(&'static str, &'static str)>) {
        if let Some(ref sink) = self.sink {
            sink.record(&MetricEvent {
                name,
                value,
                timestamp: unix_now(),
                labels,
            });
        }
    }
}

/// Current Unix timestamp in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingSink {
        events: Mutex<Vec<MetricEvent>>,
    }

    impl MetricSink for CollectingSink {
        fn record(&self, metric: &MetricEvent) {
            self.events.lock().push(metric.clone());
        }
    }

    #[test]
    fn test_counters_accumulate() {
        let recorder = MetricsRecorder::new();
        recorder.incr("bus_events_received_total");
        recorder.incr("bus_events_received_total");
        recorder.incr_by("bus_events_received_total", 3);

        let snap = recorder.snapshot();
        assert_eq!(snap.counters.get("bus_events_received_total"), Some(&5));
    }

    #[test]
    fn test_gauges_replace() {
        let recorder = MetricsRecorder::new();
        recorder.set_gauge("bus_seen_entries", 10.0);
        recorder.set_gauge("bus_seen_entries", 3.0);

        let snap = recorder.snapshot();
        assert_eq!(snap.gauges.get("bus_seen_entries"), Some(&3.0));
    }

    #[test]
    fn test_sink_fires_per_occurrence() {
        let sink = Arc::new(CollectingSink {
            events: Mutex::new(Vec::new()),
        });
        let recorder = MetricsRecorder::with_sink(sink.clone());

        recorder.incr("a_total");
        recorder.incr("a_total");
        recorder.set_gauge("g", 1.5);

        let events = sink.events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].name, "a_total");
        assert_eq!(events[2].value, 1.5);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let recorder = MetricsRecorder::new();
        recorder.incr("a_total");
        let snap = recorder.snapshot();
        recorder.incr("a_total");

        assert_eq!(snap.counters.get("a_total"), Some(&1));
        assert_eq!(recorder.snapshot().counters.get("a_total"), Some(&2));
    }

    #[test]
    fn test_labeled_counter() {
        let sink = Arc::new(CollectingSink {
            events: Mutex::new(Vec::new()),
        });
        let recorder = MetricsRecorder::with_sink(sink.clone());
        recorder.incr_labeled("bus_events_dropped_total", "reason", "duplicate");

        let snap = recorder.snapshot();
        assert_eq!(snap.counters.get("bus_events_dropped_total"), Some(&1));

        let events = sink.events.lock();
        assert_eq!(events[0].labels, vec![("reason", "duplicate")]);
    }
}
