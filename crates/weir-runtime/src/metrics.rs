//! Prometheus metrics for operators.
//!
//! One [`Metrics`] registry exists per rule bundle; each operator instance
//! binds a [`StatManager`] to its `[rule, op, instance]` label set. The
//! manager is the only writer for its labels; clones share the underlying
//! prometheus handles, so a snapshot taken anywhere observes the same
//! counters.

use crate::error::RuntimeError;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::Instant;

/// Metrics registry for a rule bundle.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    records_in: IntCounterVec,
    records_out: IntCounterVec,
    exceptions: IntCounterVec,
    buffer_length: IntGaugeVec,
    process_time: HistogramVec,
}

const LABELS: &[&str] = &["rule", "op", "instance"];

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let records_in = IntCounterVec::new(
            Opts::new("weir_records_in_total", "Records received by operator"),
            LABELS,
        )
        .expect("failed to create records_in counter");

        let records_out = IntCounterVec::new(
            Opts::new("weir_records_out_total", "Records emitted by operator"),
            LABELS,
        )
        .expect("failed to create records_out counter");

        let exceptions = IntCounterVec::new(
            Opts::new("weir_exceptions_total", "Exceptions raised by operator"),
            LABELS,
        )
        .expect("failed to create exceptions counter");

        let buffer_length = IntGaugeVec::new(
            Opts::new("weir_buffer_length", "Queued envelopes on operator input"),
            LABELS,
        )
        .expect("failed to create buffer_length gauge");

        let process_time = HistogramVec::new(
            HistogramOpts::new("weir_process_time_seconds", "Per-record processing time")
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
                ]),
            LABELS,
        )
        .expect("failed to create process_time histogram");

        registry
            .register(Box::new(records_in.clone()))
            .expect("failed to register records_in");
        registry
            .register(Box::new(records_out.clone()))
            .expect("failed to register records_out");
        registry
            .register(Box::new(exceptions.clone()))
            .expect("failed to register exceptions");
        registry
            .register(Box::new(buffer_length.clone()))
            .expect("failed to register buffer_length");
        registry
            .register(Box::new(process_time.clone()))
            .expect("failed to register process_time");

        Self {
            registry: Arc::new(registry),
            records_in,
            records_out,
            exceptions,
            buffer_length,
            process_time,
        }
    }

    /// Bind a stat manager to one operator instance's label set.
    pub fn stat_manager(
        &self,
        rule: &str,
        op: &str,
        instance: usize,
    ) -> Result<StatManager, RuntimeError> {
        let instance = instance.to_string();
        let labels = &[rule, op, instance.as_str()];
        Ok(StatManager {
            records_in: self
                .records_in
                .get_metric_with_label_values(labels)
                .map_err(|e| RuntimeError::Metrics(e.to_string()))?,
            records_out: self
                .records_out
                .get_metric_with_label_values(labels)
                .map_err(|e| RuntimeError::Metrics(e.to_string()))?,
            exceptions: self
                .exceptions
                .get_metric_with_label_values(labels)
                .map_err(|e| RuntimeError::Metrics(e.to_string()))?,
            buffer_length: self
                .buffer_length
                .get_metric_with_label_values(labels)
                .map_err(|e| RuntimeError::Metrics(e.to_string()))?,
            process_time: self
                .process_time
                .get_metric_with_label_values(labels)
                .map_err(|e| RuntimeError::Metrics(e.to_string()))?,
            started: None,
        })
    }

    /// Prometheus text output for the whole registry.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time metric values for one operator instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpMetrics {
    pub records_in: u64,
    pub records_out: u64,
    pub exceptions: u64,
    pub buffer_length: i64,
    /// Cumulative processing time in seconds.
    pub process_time_total: f64,
}

/// Per-instance metrics handle.
#[derive(Clone)]
pub struct StatManager {
    records_in: IntCounter,
    records_out: IntCounter,
    exceptions: IntCounter,
    buffer_length: IntGauge,
    process_time: Histogram,
    started: Option<Instant>,
}

impl StatManager {
    pub fn inc_records_in(&self) {
        self.records_in.inc();
    }

    pub fn inc_records_out(&self) {
        self.records_out.inc();
    }

    pub fn inc_exceptions(&self) {
        self.exceptions.inc();
    }

    pub fn set_buffer_length(&self, length: i64) {
        self.buffer_length.set(length);
    }

    pub fn process_time_start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Observe the time since `process_time_start`. A missing start is a
    /// no-op so callers on error paths need not balance the pair.
    pub fn process_time_end(&mut self) {
        if let Some(started) = self.started.take() {
            self.process_time.observe(started.elapsed().as_secs_f64());
        }
    }

    pub fn snapshot(&self) -> OpMetrics {
        OpMetrics {
            records_in: self.records_in.get(),
            records_out: self.records_out.get(),
            exceptions: self.exceptions.get(),
            buffer_length: self.buffer_length.get(),
            process_time_total: self.process_time.get_sample_sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_manager_counters() {
        let metrics = Metrics::new();
        let mut stats = metrics.stat_manager("rule1", "op1", 0).unwrap();

        stats.inc_records_in();
        stats.inc_records_in();
        stats.inc_records_out();
        stats.inc_exceptions();
        stats.set_buffer_length(7);
        stats.process_time_start();
        stats.process_time_end();

        let snap = stats.snapshot();
        assert_eq!(snap.records_in, 2);
        assert_eq!(snap.records_out, 1);
        assert_eq!(snap.exceptions, 1);
        assert_eq!(snap.buffer_length, 7);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let stats = metrics.stat_manager("rule1", "op1", 0).unwrap();
        let clone = stats.clone();
        stats.inc_records_in();
        assert_eq!(clone.snapshot().records_in, 1);
    }

    #[test]
    fn test_unbalanced_process_time_end_is_noop() {
        let metrics = Metrics::new();
        let mut stats = metrics.stat_manager("rule1", "op1", 0).unwrap();
        stats.process_time_end();
        assert_eq!(stats.snapshot().process_time_total, 0.0);
    }

    #[test]
    fn test_gather_contains_metric_names() {
        let metrics = Metrics::new();
        let stats = metrics.stat_manager("rule1", "op1", 0).unwrap();
        stats.inc_records_in();
        let output = metrics.gather();
        assert!(output.contains("weir_records_in_total"));
        assert!(output.contains("op1"));
    }
}
