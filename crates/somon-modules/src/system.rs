// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The module system façade

use crate::bundler::{Bundle, BundleRequest, Bundler};
use crate::circuit_breaker::{BreakerSettings, CircuitBreakerHealth, CircuitBreakerManager};
use crate::config::ModuleSystemConfig;
use crate::error::{ModuleError, Result};
use crate::health::{self, CheckStatus, HealthCheck, HealthReport};
use crate::metrics::{Counter, MetricsCollector, MetricsSnapshot};
use crate::module_system::{
    Loaded, LoaderOptions, ModuleGraph, ModuleLoader, ModuleRegistry, RegistryStatistics, Resolver,
};
use crate::resource_limiter::{
    MemoryUsage, MemoryWarningCallback, ResourceLimiter, ResourceLimits, ResourceStatistics,
};
use crate::server::{ManagementServer, ManagementSource};
use crate::timeout::with_timeout;
use crate::watcher::{ChangeCallback, WatchSession};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use somon_compiler::{Compiler, SomonCompiler};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// One module of a compiled graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledModule {
    /// Canonical source path
    pub id: PathBuf,
    /// Generated JavaScript
    pub code: String,
    /// Compiler source map, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_map: Option<String>,
    /// Dependency specifiers in source order
    pub dependencies: Vec<String>,
}

/// Result of [`ModuleSystem::compile`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    /// Every local module, dependencies first
    pub modules: Vec<CompiledModule>,
    /// Canonical path of the entry module
    pub entry_point: PathBuf,
    /// External libraries the graph requires
    pub dependencies: Vec<String>,
    /// Dependencies of cached modules that no longer exist on disk
    pub errors: Vec<String>,
    /// Cycle and compiler warnings
    pub warnings: Vec<String>,
}

/// Result of [`ModuleSystem::validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// No cycles and no missing dependencies
    pub is_valid: bool,
    /// One message per problem
    pub errors: Vec<String>,
}

/// Figures across every subsystem
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    /// Registry figures
    #[serde(flatten)]
    pub registry: RegistryStatistics,
    /// Distinct cycles among registered modules
    pub circular_dependencies: usize,
    /// Modules held by the cache
    pub cached_modules: usize,
    /// Bytes held by the cache
    pub cache_memory_bytes: u64,
    /// Open watch sessions
    pub active_watchers: usize,
    /// Resource counters, when limits are configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceStatistics>,
    /// Breaker counts, when breakers are enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breakers: Option<CircuitBreakerHealth>,
    /// Metrics, when enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}

/// Subsystems shared with the management endpoint
struct Shared {
    loader: Arc<ModuleLoader>,
    registry: Arc<ModuleRegistry>,
    limiter: Option<Arc<ResourceLimiter>>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    metrics: Option<Arc<MetricsCollector>>,
    sessions: DashMap<Uuid, Arc<WatchSession>>,
    management_enabled: bool,
    management_running: AtomicBool,
    shut_down: AtomicBool,
}

impl Shared {
    fn statistics(&self) -> Statistics {
        self.sessions.retain(|_, session| !session.is_closed());
        let registry = self.registry.get_statistics();
        Statistics {
            circular_dependencies: registry.circular_dependency_count,
            registry,
            cached_modules: self.loader.cache().len(),
            cache_memory_bytes: self.loader.cache().memory_bytes(),
            active_watchers: self.sessions.len(),
            resources: self.limiter.as_ref().map(|l| l.statistics()),
            circuit_breakers: self.breakers.as_ref().map(|b| b.get_overall_health()),
            metrics: self.metrics.as_ref().map(|m| m.snapshot()),
        }
    }

    fn health(&self) -> HealthReport {
        let mut checks = Vec::new();
        if self.shut_down.load(Ordering::SeqCst) {
            checks.push(HealthCheck {
                name: "lifecycle".into(),
                status: CheckStatus::Fail,
                message: "shut down".into(),
            });
        }
        checks.push(health::check_memory(self.limiter.as_deref()));
        checks.push(health::check_module_cache(
            self.limiter.as_deref(),
            self.loader.cache().len(),
        ));
        checks.push(health::check_circuit_breakers(self.breakers.as_deref()));
        checks.push(health::check_metrics(self.metrics.as_deref()));
        checks.push(health::check_registry(&self.registry));
        if self.management_enabled && !self.management_running.load(Ordering::SeqCst) {
            checks.push(HealthCheck {
                name: "managementServer".into(),
                status: CheckStatus::Warn,
                message: "enabled but not running".into(),
            });
        }
        HealthReport::from_checks(checks)
    }
}

impl ManagementSource for Shared {
    fn health(&self) -> HealthReport {
        Shared::health(self)
    }

    fn metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(|m| m.render_prometheus())
            .unwrap_or_default()
    }

    fn statistics(&self) -> serde_json::Value {
        serde_json::to_value(Shared::statistics(self)).unwrap_or_default()
    }

    fn circuit_breakers(&self) -> serde_json::Value {
        let all = self
            .breakers
            .as_ref()
            .map(|b| b.get_all_status())
            .unwrap_or_default();
        serde_json::to_value(all).unwrap_or_default()
    }
}

/// Resolution, loading, bundling and watching behind one validated configuration
pub struct ModuleSystem {
    config: ModuleSystemConfig,
    shared: Arc<Shared>,
    bundler: Bundler,
    server: Mutex<Option<ManagementServer>>,
}

impl std::fmt::Debug for ModuleSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSystem")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ModuleSystem {
    /// Create a module system using the Somon compiler
    pub fn new(config: ModuleSystemConfig) -> Result<Self> {
        Self::with_compiler(config, Arc::new(SomonCompiler::new()))
    }

    /// Create a module system with a custom compiler.
    ///
    /// The configuration is validated before anything starts; every violation
    /// is reported in one [`ModuleError::Configuration`].
    pub fn with_compiler(config: ModuleSystemConfig, compiler: Arc<dyn Compiler>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ModuleRegistry::new());
        let resolver = Resolver::new(config.resolution.clone());
        let mut loader = ModuleLoader::new(resolver, compiler, LoaderOptions::from(&config))
            .with_registry(registry.clone());

        let limiter = config
            .resource_limits
            .as_ref()
            .map(|limits| Arc::new(ResourceLimiter::new(ResourceLimits::from(limits))));
        if let Some(limiter) = &limiter {
            loader = loader.with_resource_limiter(limiter.clone());
        }
        let breakers = config
            .circuit_breakers
            .then(|| Arc::new(CircuitBreakerManager::new(BreakerSettings::from(&config.circuit_breaker))));
        if let Some(breakers) = &breakers {
            loader = loader.with_circuit_breakers(breakers.clone());
        }
        let metrics = config.metrics.then(|| Arc::new(MetricsCollector::new()));
        if let Some(metrics) = &metrics {
            loader = loader.with_metrics(metrics.clone());
        }

        let loader = Arc::new(loader);
        if let Some(limiter) = &limiter {
            limiter.on_memory_warning(memory_pressure_handler(
                Arc::downgrade(&loader),
                limiter.limits().memory_warning_thresholds.last().copied(),
            ));
            limiter.start();
        }

        let shared = Arc::new(Shared {
            loader: loader.clone(),
            registry,
            limiter,
            breakers,
            metrics,
            sessions: DashMap::new(),
            management_enabled: config.management_server,
            management_running: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });

        info!(
            metrics = config.metrics,
            circuit_breakers = config.circuit_breakers,
            resource_limits = config.resource_limits.is_some(),
            "Module system ready"
        );
        Ok(Self {
            bundler: Bundler::new(loader),
            config,
            shared,
            server: Mutex::new(None),
        })
    }

    /// The validated configuration
    pub fn config(&self) -> &ModuleSystemConfig {
        &self.config
    }

    /// The module registry
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.shared.registry
    }

    /// Circuit breakers, when enabled
    pub fn circuit_breakers(&self) -> Option<&Arc<CircuitBreakerManager>> {
        self.shared.breakers.as_ref()
    }

    /// Metrics, when enabled
    pub fn metrics(&self) -> Option<&Arc<MetricsCollector>> {
        self.shared.metrics.as_ref()
    }

    /// Resource limiter, when limits are configured
    pub fn resource_limiter(&self) -> Option<&Arc<ResourceLimiter>> {
        self.shared.limiter.as_ref()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            Err(ModuleError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn timed<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_running()?;
        let result = with_timeout(operation, self.config.operation_timeout(), future).await;
        if let (Err(ModuleError::Timeout { .. }), Some(metrics)) = (&result, &self.shared.metrics) {
            metrics.increment(Counter::Timeouts);
        }
        result
    }

    async fn load_entry(&self, path: &Path) -> Result<ModuleGraph> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let from_dir = absolute.parent().unwrap_or(&absolute).to_path_buf();
        let specifier = absolute.to_string_lossy().into_owned();
        match self.shared.loader.load(&specifier, &from_dir).await? {
            Loaded::Module(graph) => Ok(graph),
            Loaded::External(name) => Err(ModuleError::resolution(name, &from_dir)),
        }
    }

    /// Compile `path` and everything it imports
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn compile(&self, path: &Path) -> Result<CompileResult> {
        self.timed("compile", async {
            let graph = self.load_entry(path).await?;
            let paths = graph.paths();
            let errors = self
                .shared
                .registry
                .find_missing_dependencies()
                .into_iter()
                .filter(|m| paths.contains(&m.from))
                .map(|m| {
                    format!(
                        "'{}' imported by '{}' no longer exists at '{}'",
                        m.specifier,
                        m.from.display(),
                        m.target.display()
                    )
                })
                .collect();

            Ok(CompileResult {
                modules: graph
                    .modules
                    .iter()
                    .map(|m| CompiledModule {
                        id: m.id.clone(),
                        code: m.code.clone(),
                        source_map: m.source_map.clone(),
                        dependencies: m.dependencies.iter().map(|d| d.specifier.clone()).collect(),
                    })
                    .collect(),
                entry_point: graph.entry.id.clone(),
                dependencies: graph.externals,
                errors,
                warnings: graph.warnings,
            })
        })
        .await
    }

    /// Bundle an entry point and its dependencies into one file
    #[instrument(skip_all, fields(entry = %request.entry_point.display()))]
    pub async fn bundle(&self, request: &BundleRequest) -> Result<Bundle> {
        let started = Instant::now();
        let result = self.timed("bundle", self.bundler.bundle(request)).await;
        if let Some(metrics) = &self.shared.metrics {
            match &result {
                Ok(_) => metrics.increment(Counter::Bundles),
                Err(_) => metrics.increment(Counter::BundleFailures),
            }
            metrics.observe("bundle", started.elapsed());
        }
        result
    }

    /// Load `specifier` as imported from `base_dir`
    #[instrument(skip_all, fields(specifier = %specifier, base_dir = %base_dir.display()))]
    pub async fn load_module(&self, specifier: &str, base_dir: &Path) -> Result<Loaded> {
        self.timed("loadModule", self.shared.loader.load(specifier, base_dir))
            .await
    }

    /// Watch `entry_point` and its current dependencies.
    ///
    /// If the entry cannot be loaded right now only the entry itself is
    /// watched, so a broken file can still be edited into shape.
    #[instrument(skip_all, fields(entry = %entry_point.display()))]
    pub async fn watch(&self, entry_point: &Path, on_change: ChangeCallback) -> Result<Arc<WatchSession>> {
        self.timed("watch", async {
            let paths = match self.load_entry(entry_point).await {
                Ok(graph) => graph.paths(),
                Err(e) => {
                    warn!(error = %e, "Watching entry point only");
                    let absolute = if entry_point.is_absolute() {
                        entry_point.to_path_buf()
                    } else {
                        std::env::current_dir()?.join(entry_point)
                    };
                    vec![absolute]
                }
            };
            let session = WatchSession::start(paths, on_change)?;
            self.shared.sessions.insert(session.id(), session.clone());
            Ok(session)
        })
        .await
    }

    /// Close every watch session; returns how many were open
    pub fn stop_watching(&self) -> usize {
        let ids: Vec<Uuid> = self.shared.sessions.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            let Some((_, session)) = self.shared.sessions.remove(&id) else {
                continue;
            };
            if session.is_closed() {
                continue;
            }
            closed += 1;
            if let Err(e) = session.close() {
                warn!(session = %id, error = %e, "Watch session failed to close cleanly");
            }
        }
        debug!(closed, "Watch sessions stopped");
        closed
    }

    /// Check registered modules for cycles and vanished dependencies
    pub fn validate(&self) -> ValidationResult {
        let registry = &self.shared.registry;
        let mut errors: Vec<String> = registry
            .find_circular_dependencies()
            .into_iter()
            .map(|cycle| {
                let mut names: Vec<String> = cycle.iter().map(|p| p.display().to_string()).collect();
                if let Some(first) = names.first().cloned() {
                    names.push(first);
                }
                format!("Circular dependency detected: {}", names.join(" -> "))
            })
            .collect();
        errors.extend(registry.find_missing_dependencies().into_iter().map(|m| {
            format!(
                "Missing dependency '{}' of '{}' (expected at '{}')",
                m.specifier,
                m.from.display(),
                m.target.display()
            )
        }));
        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    /// Figures across every subsystem
    pub fn get_statistics(&self) -> Statistics {
        self.shared.statistics()
    }

    /// Health of every subsystem
    pub fn get_health(&self) -> HealthReport {
        self.shared.health()
    }

    /// Drop one module from the cache so the next load recompiles it
    pub fn invalidate(&self, path: &Path) -> bool {
        self.shared.loader.invalidate(path)
    }

    /// Drop every cached module
    pub fn clear_cache(&self) -> usize {
        self.shared.loader.clear()
    }

    /// Start the management endpoint on `managementPort`
    pub async fn start_management_server(&self) -> Result<SocketAddr> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.management_port as u16));
        self.start_management_server_on(addr).await
    }

    /// Start the management endpoint on a specific address
    pub async fn start_management_server_on(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.ensure_running()?;
        if !self.config.management_server {
            return Err(ModuleError::Server("managementServer is not enabled".into()));
        }
        if let Some(server) = self.server.lock().as_ref() {
            return Ok(server.local_addr());
        }

        let source: Arc<dyn ManagementSource> = self.shared.clone();
        let server = ManagementServer::start(addr, source).await?;
        let bound = server.local_addr();

        let mut slot = self.server.lock();
        if let Some(existing) = slot.as_ref() {
            // Lost a race with a concurrent start
            server.stop();
            return Ok(existing.local_addr());
        }
        *slot = Some(server);
        self.shared.management_running.store(true, Ordering::SeqCst);
        Ok(bound)
    }

    /// Stop everything and drop all cached state. Safe to call repeatedly;
    /// a failure in one step does not prevent the others.
    pub fn shutdown(&self) {
        let first = !self.shared.shut_down.swap(true, Ordering::SeqCst);

        if let Some(limiter) = &self.shared.limiter {
            limiter.stop();
        }
        self.stop_watching();
        if let Some(server) = self.server.lock().take() {
            server.stop();
        }
        self.shared.management_running.store(false, Ordering::SeqCst);
        if let Some(breakers) = &self.shared.breakers {
            breakers.shutdown();
        }
        let cleared = self.shared.loader.clear();
        if let Some(limiter) = &self.shared.limiter {
            limiter.set_module_count(0);
        }

        if first {
            info!(cleared, "Module system shut down");
        }
    }
}

impl Drop for ModuleSystem {
    fn drop(&mut self) {
        if !self.shared.shut_down.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

fn memory_pressure_handler(loader: Weak<ModuleLoader>, critical: Option<f64>) -> MemoryWarningCallback {
    Arc::new(move |usage: &MemoryUsage, limit: &str| {
        warn!(
            limit,
            used = usage.used_bytes,
            percent = format!("{:.1}", usage.percent),
            "Memory pressure"
        );
        let Some(critical) = critical else {
            return;
        };
        if usage.percent < critical {
            return;
        }
        if let Some(loader) = loader.upgrade() {
            let evicted = loader.clear();
            error!(evicted, "Critical memory usage; module cache cleared");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn system() -> ModuleSystem {
        ModuleSystem::new(ModuleSystemConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_reports_everything() {
        let mut config = ModuleSystemConfig::default();
        config.management_server = true;
        config.operation_timeout = 5;
        let err = ModuleSystem::new(config).unwrap_err();
        let ModuleError::Configuration(violations) = err else {
            panic!("expected configuration error");
        };
        assert!(violations.len() >= 3);
    }

    #[tokio::test]
    async fn test_compile_reports_graph() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.som"), "содирот собит a = 1;").unwrap();
        fs::write(
            dir.path().join("main.som"),
            "воридот { a } аз \"./a\";\nворидот fs аз \"fs\";\nтағйирёбанда x = a;",
        )
        .unwrap();
        let system = system();

        let result = system.compile(&dir.path().join("main.som")).await.unwrap();
        assert_eq!(result.modules.len(), 2);
        assert!(result.entry_point.ends_with("main.som"));
        assert_eq!(result.dependencies, vec!["fs".to_string()]);
        assert!(result.errors.is_empty());
        assert_eq!(result.modules[1].dependencies, vec!["./a", "fs"]);
    }

    #[tokio::test]
    async fn test_load_module() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.som"), "содирот собит a = 1;").unwrap();
        let system = system();

        let loaded = system.load_module("./a", dir.path()).await.unwrap();
        let graph = loaded.into_graph().unwrap();
        assert!(graph.entry.id.ends_with("a.som"));
        assert_eq!(system.registry().len(), 1);

        let external = system.load_module("fs", dir.path()).await.unwrap();
        assert!(matches!(external, Loaded::External(name) if name == "fs"));
    }

    #[tokio::test]
    async fn test_missing_dependency_reported_after_delete() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.som"), "").unwrap();
        fs::write(dir.path().join("main.som"), "воридот \"./a\";").unwrap();
        let system = system();
        system.compile(&dir.path().join("main.som")).await.unwrap();
        assert!(system.validate().is_valid);

        fs::remove_file(dir.path().join("a.som")).unwrap();
        let validation = system.validate();
        assert!(!validation.is_valid);
        assert!(validation.errors[0].starts_with("Missing dependency './a'"));

        let result = system.compile(&dir.path().join("main.som")).await.unwrap();
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_health_degrades_when_optional_subsystems_disabled() {
        let system = system();
        let report = system.get_health();
        assert_eq!(report.status, crate::health::HealthStatus::Degraded);
        assert_eq!(report.check("metrics").unwrap().status, CheckStatus::Warn);
        assert!(report.checks.iter().all(|c| c.status != CheckStatus::Fail));
    }

    #[tokio::test]
    async fn test_reports_carry_version_and_cycle_count() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.som"), "воридот \"./b\";").unwrap();
        fs::write(dir.path().join("b.som"), "воридот \"./a\";").unwrap();
        let system = system();
        system.compile(&dir.path().join("a.som")).await.unwrap();

        let health = serde_json::to_value(system.get_health()).unwrap();
        assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));

        let stats = system.get_statistics();
        assert_eq!(stats.circular_dependencies, 1);
        let stats = serde_json::to_value(stats).unwrap();
        assert_eq!(stats["circularDependencies"], 1);
        assert_eq!(stats["circularDependencyCount"], 1);
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.som"), "").unwrap();
        let system = system();
        system.shutdown();
        assert_eq!(
            system.compile(&dir.path().join("main.som")).await.unwrap_err(),
            ModuleError::ShutDown
        );
        assert_eq!(system.get_health().status, crate::health::HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_management_server_lifecycle() {
        let mut config = ModuleSystemConfig::default();
        config.metrics = true;
        config.circuit_breakers = true;
        config.management_server = true;
        let system = ModuleSystem::new(config).unwrap();

        let addr = system
            .start_management_server_on("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        assert!(system.get_health().check("managementServer").is_none());
        system.shutdown();
        assert!(system.get_health().check("managementServer").is_some());
        assert!(system
            .start_management_server_on("127.0.0.1:0".parse().unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_memory_pressure_clears_cache() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.som"), "").unwrap();
        let system = system();
        system.compile(&dir.path().join("main.som")).await.unwrap();

        let handler = memory_pressure_handler(Arc::downgrade(&system.shared.loader), Some(95.0));
        let usage = |percent| MemoryUsage {
            used_bytes: 0,
            limit_bytes: 1,
            percent,
        };
        handler(&usage(85.0), "maxMemoryBytes");
        assert_eq!(system.get_statistics().cached_modules, 1);
        handler(&usage(96.0), "maxMemoryBytes");
        assert_eq!(system.get_statistics().cached_modules, 0);
    }
}
