// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Counters and response-time histograms for the module system

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cumulative histogram bucket bounds in milliseconds.
///
/// Existing dashboards depend on these exact boundaries.
pub const HISTOGRAM_BUCKETS_MS: [u64; 10] = [10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Named counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    /// Modules read and compiled
    ModulesLoaded,
    /// Loads that failed
    LoadFailures,
    /// Loads served from the cache
    CacheHits,
    /// Loads that had to compile
    CacheMisses,
    /// Modules evicted from the cache
    CacheEvictions,
    /// Bundles produced
    Bundles,
    /// Bundles that failed
    BundleFailures,
    /// Operations that timed out
    Timeouts,
}

impl Counter {
    const ALL: [Counter; 8] = [
        Counter::ModulesLoaded,
        Counter::LoadFailures,
        Counter::CacheHits,
        Counter::CacheMisses,
        Counter::CacheEvictions,
        Counter::Bundles,
        Counter::BundleFailures,
        Counter::Timeouts,
    ];

    /// Metric name without prefix
    pub fn name(&self) -> &'static str {
        match self {
            Counter::ModulesLoaded => "modules_loaded_total",
            Counter::LoadFailures => "load_failures_total",
            Counter::CacheHits => "cache_hits_total",
            Counter::CacheMisses => "cache_misses_total",
            Counter::CacheEvictions => "cache_evictions_total",
            Counter::Bundles => "bundles_total",
            Counter::BundleFailures => "bundle_failures_total",
            Counter::Timeouts => "timeouts_total",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Counter::ModulesLoaded => "Modules read and compiled",
            Counter::LoadFailures => "Module loads that failed",
            Counter::CacheHits => "Module loads served from the cache",
            Counter::CacheMisses => "Module loads that required compilation",
            Counter::CacheEvictions => "Modules evicted from the cache",
            Counter::Bundles => "Bundles produced",
            Counter::BundleFailures => "Bundle requests that failed",
            Counter::Timeouts => "Operations that exceeded their timeout",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Default)]
struct Histogram {
    /// Cumulative: bucket `i` counts observations `<= HISTOGRAM_BUCKETS_MS[i]`
    buckets: [AtomicU64; HISTOGRAM_BUCKETS_MS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn observe(&self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        for (bound, bucket) in HISTOGRAM_BUCKETS_MS.iter().zip(&self.buckets) {
            if ms <= *bound as f64 {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: HISTOGRAM_BUCKETS_MS
                .iter()
                .zip(&self.buckets)
                .map(|(bound, count)| (*bound, count.load(Ordering::Relaxed)))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Histogram figures
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramSnapshot {
    /// `(upper bound ms, cumulative count)` pairs
    pub buckets: Vec<(u64, u64)>,
    /// Observations
    pub count: u64,
    /// Sum of observations in milliseconds
    pub sum_ms: f64,
}

/// Every metric at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Counter values by name
    pub counters: BTreeMap<String, u64>,
    /// Histograms by operation
    pub durations: BTreeMap<String, HistogramSnapshot>,
}

/// Thread-safe metrics store
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: [AtomicU64; Counter::ALL.len()],
    durations: DashMap<String, Histogram>,
}

impl MetricsCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one to a counter
    pub fn increment(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter value
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Record how long an operation took
    pub fn observe(&self, operation: &str, duration: Duration) {
        if let Some(histogram) = self.durations.get(operation) {
            histogram.observe(duration);
            return;
        }
        self.durations
            .entry(operation.to_string())
            .or_default()
            .observe(duration);
    }

    /// Histogram for one operation
    pub fn histogram(&self, operation: &str) -> Option<HistogramSnapshot> {
        self.durations.get(operation).map(|h| h.snapshot())
    }

    /// All metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: Counter::ALL
                .iter()
                .map(|c| (c.name().to_string(), self.get(*c)))
                .collect(),
            durations: self
                .durations
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
        }
    }

    /// Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        for counter in Counter::ALL {
            let name = format!("somon_{}", counter.name());
            let _ = writeln!(out, "# HELP {} {}", name, counter.help());
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, self.get(counter));
        }

        let name = "somon_operation_duration_ms";
        let _ = writeln!(out, "# HELP {} Operation duration in milliseconds", name);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for (operation, histogram) in &snapshot.durations {
            for (bound, count) in &histogram.buckets {
                let _ = writeln!(
                    out,
                    "{}_bucket{{operation=\"{}\",le=\"{}\"}} {}",
                    name, operation, bound, count
                );
            }
            let _ = writeln!(
                out,
                "{}_bucket{{operation=\"{}\",le=\"+Inf\"}} {}",
                name, operation, histogram.count
            );
            let _ = writeln!(out, "{}_sum{{operation=\"{}\"}} {}", name, operation, histogram.sum_ms);
            let _ = writeln!(out, "{}_count{{operation=\"{}\"}} {}", name, operation, histogram.count);
        }
        out
    }
}
