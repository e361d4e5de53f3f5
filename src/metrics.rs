//! Observability counters for the ingestion pipeline
//!
//! One counter per materialization outcome and per error class, plus
//! delivery latency tracking for percentile exposition. Exported as a
//! `BTreeMap` for Prometheus-style scraping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::classify::ErrorClass;
use crate::materialize::Outcome;

/// Core metrics for the pipeline.
pub struct PipelineMetrics {
    pub deliveries_total: AtomicU64,
    pub outcome_applied: AtomicU64,
    pub outcome_duplicate_noop: AtomicU64,
    pub outcome_stale_ignored: AtomicU64,
    pub errors_poison: AtomicU64,
    pub errors_transient: AtomicU64,
    pub errors_fatal_config: AtomicU64,
    pub handle_latency_us: Mutex<LatencyTracker>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            deliveries_total: AtomicU64::new(0),
            outcome_applied: AtomicU64::new(0),
            outcome_duplicate_noop: AtomicU64::new(0),
            outcome_stale_ignored: AtomicU64::new(0),
            errors_poison: AtomicU64::new(0),
            errors_transient: AtomicU64::new(0),
            errors_fatal_config: AtomicU64::new(0),
            handle_latency_us: Mutex::new(LatencyTracker::new(1000)),
        }
    }

    pub fn record_delivery(&self, latency_us: u64) {
        self.deliveries_total.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.handle_latency_us.lock() {
            tracker.record(latency_us);
        }
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Applied => &self.outcome_applied,
            Outcome::DuplicateNoop => &self.outcome_duplicate_noop,
            Outcome::StaleIgnored => &self.outcome_stale_ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::Poison => &self.errors_poison,
            ErrorClass::Transient => &self.errors_transient,
            ErrorClass::FatalConfig => &self.errors_fatal_config,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Export counters for exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("deliveries_total".to_string(), self.deliveries_total.load(Ordering::Relaxed));
        m.insert("outcome_applied".to_string(), self.outcome_applied.load(Ordering::Relaxed));
        m.insert(
            "outcome_duplicate_noop".to_string(),
            self.outcome_duplicate_noop.load(Ordering::Relaxed),
        );
        m.insert(
            "outcome_stale_ignored".to_string(),
            self.outcome_stale_ignored.load(Ordering::Relaxed),
        );
        m.insert("errors_poison".to_string(), self.errors_poison.load(Ordering::Relaxed));
        m.insert("errors_transient".to_string(), self.errors_transient.load(Ordering::Relaxed));
        m.insert(
            "errors_fatal_config".to_string(),
            self.errors_fatal_config.load(Ordering::Relaxed),
        );
        if let Ok(tracker) = self.handle_latency_us.lock() {
            if let Some(p99) = tracker.p99() {
                m.insert("handle_latency_us_p99".to_string(), p99);
            }
        }
        m
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded window of latency samples; only the p99 is exposed.
pub struct LatencyTracker {
    samples: Vec<u64>,
    capacity: usize,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sample, evicting the oldest once the window is full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.capacity {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// p99 over the current window.
    pub fn p99(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        // Nearest-rank: the sample at or above the 99th percentile.
        let idx = (sorted.len() * 99).div_ceil(100) - 1;
        Some(sorted[idx])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_outcome(Outcome::Applied);
        metrics.record_outcome(Outcome::Applied);
        metrics.record_outcome(Outcome::StaleIgnored);
        metrics.record_outcome(Outcome::DuplicateNoop);

        let exported = metrics.export();
        assert_eq!(exported["outcome_applied"], 2);
        assert_eq!(exported["outcome_stale_ignored"], 1);
        assert_eq!(exported["outcome_duplicate_noop"], 1);
    }

    #[test]
    fn test_error_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_error(ErrorClass::Poison);
        metrics.record_error(ErrorClass::Transient);
        metrics.record_error(ErrorClass::Transient);
        metrics.record_error(ErrorClass::FatalConfig);

        let exported = metrics.export();
        assert_eq!(exported["errors_poison"], 1);
        assert_eq!(exported["errors_transient"], 2);
        assert_eq!(exported["errors_fatal_config"], 1);
    }

    #[test]
    fn test_latency_window_evicts_and_reports_p99() {
        let mut tracker = LatencyTracker::new(3);
        assert_eq!(tracker.p99(), None);

        tracker.record(10);
        tracker.record(20);
        tracker.record(30);
        tracker.record(40); // evicts 10

        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.p99(), Some(40));
    }

    #[test]
    fn test_delivery_latency_export() {
        let metrics = PipelineMetrics::new();
        metrics.record_delivery(500);
        metrics.record_delivery(700);

        let exported = metrics.export();
        assert_eq!(exported["deliveries_total"], 2);
        assert!(exported.contains_key("handle_latency_us_p99"));
    }
}
