// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Per-key circuit breakers around fallible module operations.
//!
//! # State Machine
//!
//! ```text
//! Closed --[failure_count >= threshold]--> Open
//! Open --[recovery_timeout elapsed]--> HalfOpen (one trial call)
//! HalfOpen --[trial succeeded]--> Closed
//! HalfOpen --[trial failed]--> Open
//! ```
//!
//! While a breaker is open the wrapped operation is not invoked at all, so no
//! file system or compiler work happens for that key.

use crate::config::CircuitBreakerConfig;
use crate::error::{ModuleError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls go through; failures are counted.
    Closed,
    /// Calls fail immediately.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u64,
    /// How long an open breaker waits before a trial call.
    pub recovery_timeout: Duration,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(config.recovery_timeout),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Consecutive failures since the last success.
    failure_count: u64,
    total_calls: u64,
    total_failures: u64,
    opened_at: Option<Instant>,
    /// A half-open trial is running.
    trial_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            total_calls: 0,
            total_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Observable state of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStatus {
    /// Breaker key.
    pub key: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures.
    pub failure_count: u64,
    /// Failed calls over all calls, in `[0, 1]`.
    pub failure_rate: f64,
    /// Milliseconds until a trial call is allowed, when open.
    pub next_retry_in_ms: Option<u64>,
}

/// Aggregate breaker health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerHealth {
    /// Number of breakers.
    pub total: usize,
    /// Breakers currently open.
    pub open: usize,
    /// Breakers in half-open state.
    pub half_open: usize,
    /// Breakers currently closed.
    pub healthy: usize,
}

/// A single breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

enum Admission {
    Normal,
    Trial,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(key: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            key: key.into(),
            settings,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Current state, moving an expired open breaker to half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.settings.recovery_timeout)
        {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            info!(key = %self.key, "Circuit breaker half-open; allowing one trial call");
        }
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            _ => Err(ModuleError::CircuitBreakerOpen {
                key: self.key.clone(),
                retry_in_ms: self.retry_in(&inner).as_millis() as u64,
            }),
        }
    }

    fn retry_in(&self, inner: &BreakerInner) -> Duration {
        inner
            .opened_at
            .map(|at| self.settings.recovery_timeout.saturating_sub(at.elapsed()))
            .unwrap_or_default()
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.failure_count = 0;
        if inner.state != CircuitState::Closed {
            info!(key = %self.key, "Circuit breaker CLOSED");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.trial_in_flight = false;

        let trip = trial || inner.failure_count >= self.settings.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            warn!(
                key = %self.key,
                failures = inner.failure_count,
                "Circuit breaker OPENED"
            );
        }
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Run `operation` through the breaker.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let trial = matches!(admission, Admission::Trial);
        // A dropped trial must not leave the breaker stuck half-open
        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };
        let result = operation().await;
        guard.armed = false;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => {
                debug!(key = %self.key, error = %e, "Guarded operation failed");
                self.record_failure(trial);
            }
        }
        result
    }

    /// Observable state.
    pub fn status(&self) -> CircuitBreakerStatus {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        let failure_rate = if inner.total_calls == 0 {
            0.0
        } else {
            inner.total_failures as f64 / inner.total_calls as f64
        };
        CircuitBreakerStatus {
            key: self.key.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_rate,
            next_retry_in_ms: (inner.state == CircuitState::Open)
                .then(|| self.retry_in(&inner).as_millis() as u64),
        }
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

/// Breakers keyed by module path.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    /// Create an empty manager.
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `key`, created closed on first use.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return existing.clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.settings)))
            .clone()
    }

    /// Run `operation` through the breaker for `key`.
    pub async fn call<F, Fut, T>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(key);
        breaker.call(operation).await
    }

    /// State of the breaker for `key`, if it exists.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.state())
    }

    /// Status of every breaker, sorted by key.
    pub fn get_all_status(&self) -> Vec<CircuitBreakerStatus> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.status()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Aggregate counts.
    pub fn get_overall_health(&self) -> CircuitBreakerHealth {
        let mut health = CircuitBreakerHealth {
            total: 0,
            open: 0,
            half_open: 0,
            healthy: 0,
        };
        for breaker in self.breakers.iter() {
            health.total += 1;
            match breaker.state() {
                CircuitState::Closed => health.healthy += 1,
                CircuitState::Open => health.open += 1,
                CircuitState::HalfOpen => health.half_open += 1,
            }
        }
        health
    }

    /// Drop every breaker.
    pub fn shutdown(&self) {
        let count = self.breakers.len();
        self.breakers.clear();
        debug!(count, "Circuit breakers cleared");
    }
}
