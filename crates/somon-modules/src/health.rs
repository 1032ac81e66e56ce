// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Health checks over the module system's subsystems

use crate::circuit_breaker::CircuitBreakerManager;
use crate::metrics::MetricsCollector;
use crate::module_system::ModuleRegistry;
use crate::resource_limiter::ResourceLimiter;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Overall status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every check passed
    Healthy,
    /// Some check warned
    Degraded,
    /// Some check failed
    Unhealthy,
}

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Fine
    Pass,
    /// Working, but disabled or close to a limit
    Warn,
    /// Not working
    Fail,
}

/// One named check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Subsystem name
    pub name: String,
    /// Outcome
    pub status: CheckStatus,
    /// Human readable detail
    pub message: String,
}

impl HealthCheck {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }
}

/// Health of the whole system
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Worst status across checks
    pub status: HealthStatus,
    /// Crate version reporting the health
    pub version: &'static str,
    /// Individual checks
    pub checks: Vec<HealthCheck>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl HealthReport {
    /// Summarize `checks`
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = if checks.iter().any(|c| c.status == CheckStatus::Fail) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == CheckStatus::Warn) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            status,
            version: env!("CARGO_PKG_VERSION"),
            checks,
            timestamp,
        }
    }

    /// Look up a check by name
    pub fn check(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Process memory against the configured ceiling
pub fn check_memory(limiter: Option<&ResourceLimiter>) -> HealthCheck {
    let Some(limiter) = limiter else {
        return HealthCheck::new("memory", CheckStatus::Warn, "resource limits disabled");
    };
    let Some(usage) = limiter.check_memory() else {
        return HealthCheck::new("memory", CheckStatus::Warn, "memory usage unavailable");
    };
    let first_threshold = limiter
        .limits()
        .memory_warning_thresholds
        .first()
        .copied()
        .unwrap_or(80.0);
    let status = if usage.percent >= 100.0 {
        CheckStatus::Fail
    } else if usage.percent >= first_threshold {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    HealthCheck::new(
        "memory",
        status,
        format!(
            "{} of {} bytes ({:.1}%)",
            usage.used_bytes, usage.limit_bytes, usage.percent
        ),
    )
}

/// Cached modules against the configured ceiling
pub fn check_module_cache(limiter: Option<&ResourceLimiter>, cached: usize) -> HealthCheck {
    let Some(limiter) = limiter else {
        return HealthCheck::new("moduleCache", CheckStatus::Pass, format!("{} modules cached", cached));
    };
    let max = limiter.limits().max_cached_modules;
    let count = limiter.module_count();
    let status = if count >= max {
        CheckStatus::Fail
    } else if count * 10 >= max * 9 {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    HealthCheck::new(
        "moduleCache",
        status,
        format!("{} of {} modules cached", count, max),
    )
}

/// Open circuit breakers
pub fn check_circuit_breakers(breakers: Option<&CircuitBreakerManager>) -> HealthCheck {
    let Some(breakers) = breakers else {
        return HealthCheck::new("circuitBreakers", CheckStatus::Warn, "circuit breakers disabled");
    };
    let health = breakers.get_overall_health();
    if health.open == 0 && health.half_open == 0 {
        return HealthCheck::new(
            "circuitBreakers",
            CheckStatus::Pass,
            format!("{} breakers closed", health.total),
        );
    }
    HealthCheck::new(
        "circuitBreakers",
        CheckStatus::Warn,
        format!(
            "{} open, {} half-open of {}",
            health.open, health.half_open, health.total
        ),
    )
}

/// Whether metrics are collected
pub fn check_metrics(metrics: Option<&MetricsCollector>) -> HealthCheck {
    match metrics {
        Some(_) => HealthCheck::new("metrics", CheckStatus::Pass, "collecting"),
        None => HealthCheck::new("metrics", CheckStatus::Warn, "metrics disabled"),
    }
}

/// Cycles and vanished files among registered modules
pub fn check_registry(registry: &ModuleRegistry) -> HealthCheck {
    let cycles = registry.find_circular_dependencies().len();
    let missing = registry.find_missing_dependencies().len();
    if cycles == 0 && missing == 0 {
        return HealthCheck::new(
            "registry",
            CheckStatus::Pass,
            format!("{} modules registered", registry.len()),
        );
    }
    HealthCheck::new(
        "registry",
        CheckStatus::Warn,
        format!("{} circular dependencies, {} missing dependencies", cycles, missing),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerSettings;
    use crate::resource_limiter::ResourceLimits;
    use std::sync::Arc;

    fn limiter_at(used: u64) -> ResourceLimiter {
        ResourceLimiter::with_memory_source(
            ResourceLimits {
                max_memory_bytes: 1000,
                ..Default::default()
            },
            Arc::new(move || Some(used)),
        )
    }

    #[test]
    fn test_status_is_worst_check() {
        let pass = HealthCheck::new("a", CheckStatus::Pass, "");
        let warn = HealthCheck::new("b", CheckStatus::Warn, "");
        let fail = HealthCheck::new("c", CheckStatus::Fail, "");

        assert_eq!(HealthReport::from_checks(vec![pass.clone()]).status, HealthStatus::Healthy);
        assert_eq!(
            HealthReport::from_checks(vec![pass.clone(), warn.clone()]).status,
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthReport::from_checks(vec![pass, warn, fail]).status,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_disabled_subsystems_warn() {
        assert_eq!(check_metrics(None).status, CheckStatus::Warn);
        assert_eq!(check_circuit_breakers(None).status, CheckStatus::Warn);
        assert_eq!(check_memory(None).status, CheckStatus::Warn);
        assert_eq!(check_metrics(Some(&MetricsCollector::new())).status, CheckStatus::Pass);
    }

    #[test]
    fn test_memory_thresholds() {
        assert_eq!(check_memory(Some(&limiter_at(100))).status, CheckStatus::Pass);
        assert_eq!(check_memory(Some(&limiter_at(850))).status, CheckStatus::Warn);
        assert_eq!(check_memory(Some(&limiter_at(1200))).status, CheckStatus::Fail);
    }

    #[test]
    fn test_module_cache_ceiling() {
        let limiter = ResourceLimiter::new(ResourceLimits {
            max_cached_modules: 10,
            ..Default::default()
        });
        assert_eq!(check_module_cache(Some(&limiter), 0).status, CheckStatus::Pass);
        limiter.set_module_count(9);
        assert_eq!(check_module_cache(Some(&limiter), 9).status, CheckStatus::Warn);
        limiter.set_module_count(10);
        assert_eq!(check_module_cache(Some(&limiter), 10).status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn test_open_breaker_warns() {
        let breakers = CircuitBreakerManager::new(BreakerSettings {
            failure_threshold: 1,
            ..Default::default()
        });
        assert_eq!(check_circuit_breakers(Some(&breakers)).status, CheckStatus::Pass);
        let _ = breakers
            .call("x", || async { Err::<(), _>(crate::ModuleError::bundle("boom")) })
            .await;
        let check = check_circuit_breakers(Some(&breakers));
        assert_eq!(check.status, CheckStatus::Warn);
        assert_eq!(check.message, "1 open, 0 half-open of 1");
    }

    #[test]
    fn test_registry_check() {
        let registry = ModuleRegistry::new();
        let check = check_registry(&registry);
        assert_eq!(check.status, CheckStatus::Pass);
        assert_eq!(check.message, "0 modules registered");
    }
}
