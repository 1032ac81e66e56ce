// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Resource ceilings for the module cache, open files and process memory

use crate::config::ResourceLimitsConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Immutable resource ceilings
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Process memory ceiling in bytes
    pub max_memory_bytes: u64,
    /// Concurrently open source files
    pub max_file_handles: u64,
    /// Cached modules
    pub max_cached_modules: u64,
    /// Memory sampling interval
    pub check_interval: Duration,
    /// Usage percentages at which warnings fire, ascending
    pub memory_warning_thresholds: Vec<f64>,
}

impl From<&ResourceLimitsConfig> for ResourceLimits {
    fn from(config: &ResourceLimitsConfig) -> Self {
        let mut thresholds = config.memory_warning_thresholds.clone();
        thresholds.sort_by(|a, b| a.total_cmp(b));
        Self {
            max_memory_bytes: config.max_memory_bytes,
            max_file_handles: config.max_file_handles,
            max_cached_modules: config.max_cached_modules,
            check_interval: Duration::from_millis(config.check_interval),
            memory_warning_thresholds: thresholds,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from(&ResourceLimitsConfig::default())
    }
}

/// One memory sample
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    /// Resident memory of this process
    pub used_bytes: u64,
    /// Configured ceiling
    pub limit_bytes: u64,
    /// `used / limit` as a percentage
    pub percent: f64,
}

/// Counter snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatistics {
    /// Cached modules
    pub cached_modules: u64,
    /// Ceiling for cached modules
    pub max_cached_modules: u64,
    /// Open file handles
    pub file_handles: u64,
    /// Ceiling for open file handles
    pub max_file_handles: u64,
    /// Last memory sample, if any
    pub memory: Option<MemoryUsage>,
    /// Whether the periodic sampler runs
    pub monitoring: bool,
}

/// Observer invoked with a sample and the name of the limit being approached
pub type MemoryWarningCallback = Arc<dyn Fn(&MemoryUsage, &str) + Send + Sync>;

/// Source of the current memory usage in bytes
pub type MemorySource = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

/// Tracks counters against ceilings and samples memory periodically
pub struct ResourceLimiter {
    limits: ResourceLimits,
    cached_modules: AtomicU64,
    file_handles: AtomicU64,
    callbacks: Mutex<Vec<MemoryWarningCallback>>,
    memory_source: MemorySource,
    last_sample: Mutex<Option<MemoryUsage>>,
    /// Number of thresholds crossed at the last sample
    crossed: AtomicUsize,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLimiter")
            .field("limits", &self.limits)
            .field("cached_modules", &self.cached_modules)
            .field("file_handles", &self.file_handles)
            .finish_non_exhaustive()
    }
}

impl ResourceLimiter {
    /// Create a limiter sampling this process's resident memory
    pub fn new(limits: ResourceLimits) -> Self {
        Self::with_memory_source(limits, Arc::new(process_memory))
    }

    /// Create a limiter with a custom memory source
    pub fn with_memory_source(limits: ResourceLimits, memory_source: MemorySource) -> Self {
        Self {
            limits,
            cached_modules: AtomicU64::new(0),
            file_handles: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
            memory_source,
            last_sample: Mutex::new(None),
            crossed: AtomicUsize::new(0),
            sampler: Mutex::new(None),
        }
    }

    /// The configured ceilings
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Whether one more module fits in the cache
    pub fn can_load_module(&self) -> bool {
        self.cached_modules.load(Ordering::SeqCst) < self.limits.max_cached_modules
    }

    /// Whether one more file may be opened
    pub fn can_open_file(&self) -> bool {
        self.file_handles.load(Ordering::SeqCst) < self.limits.max_file_handles
    }

    /// Count a newly cached module
    pub fn increment_module_count(&self) {
        self.cached_modules.fetch_add(1, Ordering::SeqCst);
    }

    /// Count an evicted module; never goes below zero
    pub fn decrement_module_count(&self) {
        saturating_decrement(&self.cached_modules);
    }

    /// Overwrite the module count; negative input clamps to zero
    pub fn set_module_count(&self, count: i64) {
        self.cached_modules
            .store(u64::try_from(count).unwrap_or(0), Ordering::SeqCst);
    }

    /// Current module count
    pub fn module_count(&self) -> u64 {
        self.cached_modules.load(Ordering::SeqCst)
    }

    /// Count an opened file
    pub fn increment_file_handles(&self) {
        self.file_handles.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a closed file; never goes below zero
    pub fn decrement_file_handles(&self) {
        saturating_decrement(&self.file_handles);
    }

    /// Current open file count
    pub fn file_handle_count(&self) -> u64 {
        self.file_handles.load(Ordering::SeqCst)
    }

    /// Reserve room for one cached module; `None` when the cache is full.
    ///
    /// The reservation is released on drop unless committed.
    pub fn try_reserve_module(self: &Arc<Self>) -> Option<ModuleReservation> {
        try_acquire(&self.cached_modules, self.limits.max_cached_modules).then(|| {
            ModuleReservation {
                limiter: self.clone(),
                armed: true,
            }
        })
    }

    /// Count one open file until the returned handle drops; `None` at the ceiling
    pub fn try_open_file(self: &Arc<Self>) -> Option<FileHandle> {
        try_acquire(&self.file_handles, self.limits.max_file_handles).then(|| FileHandle {
            limiter: self.clone(),
        })
    }

    /// Register a memory warning observer
    pub fn on_memory_warning(&self, callback: MemoryWarningCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Take one memory sample, notifying observers when a new threshold is crossed
    pub fn check_memory(&self) -> Option<MemoryUsage> {
        let used_bytes = (self.memory_source)()?;
        let limit_bytes = self.limits.max_memory_bytes.max(1);
        let usage = MemoryUsage {
            used_bytes,
            limit_bytes,
            percent: used_bytes as f64 * 100.0 / limit_bytes as f64,
        };
        *self.last_sample.lock() = Some(usage.clone());

        let crossed = self
            .limits
            .memory_warning_thresholds
            .iter()
            .filter(|t| usage.percent >= **t)
            .count();
        let previously = self.crossed.swap(crossed, Ordering::SeqCst);
        if crossed > previously {
            warn!(
                used = usage.used_bytes,
                limit = usage.limit_bytes,
                percent = format!("{:.1}", usage.percent),
                "Memory usage crossed warning threshold"
            );
            self.notify(&usage, "maxMemoryBytes");
        }
        Some(usage)
    }

    fn notify(&self, usage: &MemoryUsage, limit_name: &str) {
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(usage, limit_name)));
            if result.is_err() {
                error!(limit = limit_name, "Memory warning callback panicked");
            }
        }
    }

    /// Start periodic memory sampling; returns false without a Tokio runtime
    pub fn start(self: &Arc<Self>) -> bool {
        let mut sampler = self.sampler.lock();
        if sampler.is_some() {
            return true;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; memory sampling disabled");
            return false;
        };

        let limiter = Arc::downgrade(self);
        let period = self.limits.check_interval;
        *sampler = Some(handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.check_memory();
            }
        }));
        debug!(interval_ms = period.as_millis() as u64, "Resource monitoring started");
        true
    }

    /// Stop periodic sampling; safe to call repeatedly
    pub fn stop(&self) {
        if let Some(task) = self.sampler.lock().take() {
            task.abort();
            debug!("Resource monitoring stopped");
        }
    }

    /// Whether periodic sampling is active
    pub fn is_running(&self) -> bool {
        self.sampler.lock().is_some()
    }

    /// Request a garbage collection.
    ///
    /// Memory here is reclaimed deterministically, so there is nothing to
    /// trigger; returns whether a collection ran.
    pub fn force_gc(&self) -> bool {
        debug!("forceGC requested; no collector to trigger");
        false
    }

    /// Counter snapshot
    pub fn statistics(&self) -> ResourceStatistics {
        ResourceStatistics {
            cached_modules: self.module_count(),
            max_cached_modules: self.limits.max_cached_modules,
            file_handles: self.file_handle_count(),
            max_file_handles: self.limits.max_file_handles,
            memory: self.last_sample.lock().clone(),
            monitoring: self.is_running(),
        }
    }
}

impl Drop for ResourceLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A cached-module slot held against `maxCachedModules`
#[derive(Debug)]
#[must_use = "dropping a reservation releases it"]
pub struct ModuleReservation {
    limiter: Arc<ResourceLimiter>,
    armed: bool,
}

impl ModuleReservation {
    /// Keep the module counted; it is released later by eviction
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for ModuleReservation {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.decrement_module_count();
        }
    }
}

/// An open file counted against `maxFileHandles` until dropped
#[derive(Debug)]
#[must_use = "dropping the handle closes it"]
pub struct FileHandle {
    limiter: Arc<ResourceLimiter>,
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.limiter.decrement_file_handles();
    }
}

/// Increment `counter` unless it is already at `max`
fn try_acquire(counter: &AtomicU64, max: u64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
        .is_ok()
}

fn saturating_decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        Some(n.saturating_sub(1))
    });
}

/// Resident memory of the current process
fn process_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new().with_memory(),
    );
    system.process(pid).map(|p| p.memory())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn limits(modules: u64, files: u64) -> ResourceLimits {
        ResourceLimits {
            max_cached_modules: modules,
            max_file_handles: files,
            ..Default::default()
        }
    }

    #[test]
    fn test_counters_never_negative() {
        let limiter = ResourceLimiter::new(limits(10, 10));
        limiter.decrement_module_count();
        limiter.decrement_file_handles();
        assert_eq!(limiter.module_count(), 0);
        assert_eq!(limiter.file_handle_count(), 0);

        limiter.set_module_count(-5);
        assert_eq!(limiter.module_count(), 0);
        limiter.set_module_count(7);
        assert_eq!(limiter.module_count(), 7);
    }

    #[test]
    fn test_module_capacity() {
        let n = 3;
        let limiter = ResourceLimiter::new(limits(n, 10));
        let mut admitted = 0;
        for _ in 0..n + 1 {
            if limiter.can_load_module() {
                limiter.increment_module_count();
                admitted += 1;
            }
        }
        assert_eq!(admitted, n);
        assert!(!limiter.can_load_module());

        limiter.decrement_module_count();
        assert!(limiter.can_load_module());
    }

    #[test]
    fn test_reservations_respect_ceiling() {
        let limiter = Arc::new(ResourceLimiter::new(limits(2, 1)));
        let first = limiter.try_reserve_module().unwrap();
        let second = limiter.try_reserve_module().unwrap();
        assert!(limiter.try_reserve_module().is_none());
        assert_eq!(limiter.module_count(), 2);

        first.commit();
        drop(second);
        assert_eq!(limiter.module_count(), 1);

        let handle = limiter.try_open_file().unwrap();
        assert!(limiter.try_open_file().is_none());
        drop(handle);
        assert_eq!(limiter.file_handle_count(), 0);
    }

    #[test]
    fn test_concurrent_reservations() {
        let limiter = Arc::new(ResourceLimiter::new(limits(5, 10)));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    limiter
                        .try_reserve_module()
                        .map(ModuleReservation::commit)
                        .is_some()
                })
            })
            .collect();
        let admitted = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(limiter.module_count(), 5);
    }

    #[test]
    fn test_file_handles() {
        let limiter = ResourceLimiter::new(limits(10, 1));
        assert!(limiter.can_open_file());
        limiter.increment_file_handles();
        assert!(!limiter.can_open_file());
        limiter.decrement_file_handles();
        assert!(limiter.can_open_file());
    }

    #[test]
    fn test_memory_warnings_fire_on_crossing() {
        let used = Arc::new(AtomicU64::new(50));
        let source = used.clone();
        let limiter = ResourceLimiter::with_memory_source(
            ResourceLimits {
                max_memory_bytes: 100,
                ..Default::default()
            },
            Arc::new(move || Some(source.load(Ordering::SeqCst))),
        );
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        limiter.on_memory_warning(Arc::new(move |usage, name| {
            sink.lock().push((usage.used_bytes, name.to_string()));
        }));

        limiter.check_memory();
        used.store(85, Ordering::SeqCst);
        limiter.check_memory();
        limiter.check_memory();
        used.store(97, Ordering::SeqCst);
        let usage = limiter.check_memory().unwrap();
        assert_eq!(usage.percent, 97.0);

        assert_eq!(
            *fired.lock(),
            vec![(85, "maxMemoryBytes".to_string()), (97, "maxMemoryBytes".to_string())]
        );
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let limiter = ResourceLimiter::with_memory_source(
            ResourceLimits {
                max_memory_bytes: 100,
                ..Default::default()
            },
            Arc::new(|| Some(99)),
        );
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        limiter.on_memory_warning(Arc::new(|_, _| panic!("observer failure")));
        limiter.on_memory_warning(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(limiter.check_memory().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        limiter.increment_module_count();
        assert_eq!(limiter.module_count(), 1);
    }

    #[test]
    fn test_force_gc_is_harmless() {
        let limiter = ResourceLimiter::new(limits(1, 1));
        assert!(!limiter.force_gc());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sampling() {
        let samples = Arc::new(AtomicU64::new(0));
        let counter = samples.clone();
        let limiter = Arc::new(ResourceLimiter::with_memory_source(
            ResourceLimits {
                check_interval: Duration::from_millis(100),
                ..Default::default()
            },
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(1)
            }),
        ));

        assert!(limiter.start());
        assert!(limiter.start());
        tokio::time::sleep(Duration::from_millis(350)).await;
        let taken = samples.load(Ordering::SeqCst);
        assert!(taken >= 3, "took {} samples", taken);

        limiter.stop();
        limiter.stop();
        assert!(!limiter.is_running());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(samples.load(Ordering::SeqCst), taken);
    }

    #[test]
    fn test_start_without_runtime() {
        let limiter = Arc::new(ResourceLimiter::new(ResourceLimits::default()));
        assert!(!limiter.start());
        assert!(!limiter.is_running());
    }
}
