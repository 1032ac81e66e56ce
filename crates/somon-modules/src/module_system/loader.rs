// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module loader - reads, compiles and caches modules and walks their imports

use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::{CircularDependencyStrategy, ModuleSystemConfig};
use crate::error::{ModuleError, Result};
use crate::metrics::{Counter, MetricsCollector};
use crate::module_system::cache::{Dependency, LoadedModule, ModuleCache, ModuleSlot};
use crate::module_system::registry::ModuleRegistry;
use crate::module_system::resolver::{ResolvedModule, Resolver};
use crate::resource_limiter::{FileHandle, ModuleReservation, ResourceLimiter};
use somon_compiler::{static_requires, CompileOptions, Compiler};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, warn};

/// Loader behavior
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Keep compiled modules between loads
    pub cache: bool,
    /// Cycle policy
    pub circular_dependency_strategy: CircularDependencyStrategy,
    /// Evict beyond this many cached modules
    pub max_cache_size: Option<u64>,
    /// Evict beyond this many cached bytes
    pub max_cache_memory: Option<u64>,
    /// Options handed to the compiler; the source kind is set per file
    pub compile_options: CompileOptions,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self::from(&ModuleSystemConfig::default())
    }
}

impl From<&ModuleSystemConfig> for LoaderOptions {
    fn from(config: &ModuleSystemConfig) -> Self {
        Self {
            cache: config.loading.cache,
            circular_dependency_strategy: config.loading.circular_dependency_strategy,
            max_cache_size: config.loading.max_cache_size,
            max_cache_memory: config.loading.max_cache_memory,
            compile_options: config.compilation.compile_options(),
        }
    }
}

/// A module and everything it transitively depends on
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    /// The requested module
    pub entry: Arc<LoadedModule>,
    /// Every local module, dependencies before dependents; `entry` is last
    pub modules: Vec<Arc<LoadedModule>>,
    /// External libraries referenced anywhere in the graph, sorted
    pub externals: Vec<String>,
    /// Cycle warnings and compiler warnings
    pub warnings: Vec<String>,
}

impl ModuleGraph {
    /// Paths of every local module, in graph order
    pub fn paths(&self) -> Vec<PathBuf> {
        self.modules.iter().map(|m| m.id.clone()).collect()
    }
}

/// Result of [`ModuleLoader::load`]
#[derive(Debug, Clone)]
pub enum Loaded {
    /// A local module and its dependency graph
    Module(ModuleGraph),
    /// An external library; nothing was read or cached
    External(String),
}

impl Loaded {
    /// The loaded module, if local
    pub fn module(&self) -> Option<&Arc<LoadedModule>> {
        match self {
            Loaded::Module(graph) => Some(&graph.entry),
            Loaded::External(_) => None,
        }
    }

    /// The dependency graph, if local
    pub fn into_graph(self) -> Option<ModuleGraph> {
        match self {
            Loaded::Module(graph) => Some(graph),
            Loaded::External(_) => None,
        }
    }
}

struct Frame {
    module: Arc<LoadedModule>,
    next: usize,
}

/// Module loader
pub struct ModuleLoader {
    resolver: Resolver,
    compiler: Arc<dyn Compiler>,
    options: LoaderOptions,
    cache: ModuleCache,
    registry: Arc<ModuleRegistry>,
    limiter: Option<Arc<ResourceLimiter>>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("resolver", &self.resolver)
            .field("options", &self.options)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl ModuleLoader {
    /// Create a loader with its own registry
    pub fn new(resolver: Resolver, compiler: Arc<dyn Compiler>, options: LoaderOptions) -> Self {
        Self {
            resolver,
            compiler,
            options,
            cache: ModuleCache::new(),
            registry: Arc::new(ModuleRegistry::new()),
            limiter: None,
            breakers: None,
            metrics: None,
        }
    }

    /// Share a registry
    pub fn with_registry(mut self, registry: Arc<ModuleRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Enforce cache and file handle ceilings
    pub fn with_resource_limiter(mut self, limiter: Arc<ResourceLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Guard resolution and compilation with circuit breakers
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Record metrics
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The resolver
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// The registry modules are recorded in
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// The module cache
    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// Loader options
    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    fn count(&self, counter: Counter) {
        if let Some(metrics) = &self.metrics {
            metrics.increment(counter);
        }
    }

    /// Load `specifier` as imported from a module in `from_dir`, together with
    /// every module it transitively depends on
    pub async fn load(&self, specifier: &str, from_dir: &Path) -> Result<Loaded> {
        let started = Instant::now();
        let resolved = match &self.breakers {
            Some(breakers) => {
                let key = Resolver::lexical_key(specifier, from_dir);
                breakers
                    .call(&key, || async { self.resolver.resolve(specifier, from_dir) })
                    .await
            }
            None => self.resolver.resolve(specifier, from_dir),
        };
        let path = match resolved {
            Ok(ResolvedModule::File(path)) => path,
            Ok(ResolvedModule::External(name)) => {
                debug!(specifier = %name, "External library; not loaded");
                return Ok(Loaded::External(name));
            }
            Err(e) => {
                self.count(Counter::LoadFailures);
                return Err(e);
            }
        };

        let graph = self.load_graph(&path).await?;
        if let Some(metrics) = &self.metrics {
            metrics.observe("load", started.elapsed());
        }
        Ok(Loaded::Module(graph))
    }

    /// Load the module at a canonical `path` and its dependencies
    pub async fn load_graph(&self, path: &Path) -> Result<ModuleGraph> {
        let entry = self.load_file(path).await?;

        let mut visited: HashSet<PathBuf> = HashSet::from([entry.id.clone()]);
        let mut stack = vec![Frame {
            module: entry.clone(),
            next: 0,
        }];
        let mut modules = Vec::new();
        let mut externals = BTreeSet::new();
        let mut warnings = Vec::new();

        loop {
            let Some(frame) = stack.last_mut() else {
                break;
            };
            let Some(dep) = frame.module.dependencies.get(frame.next).cloned() else {
                if let Some(done) = stack.pop() {
                    for warning in &done.module.warnings {
                        warnings.push(format!("{}: {}", done.module.id.display(), warning));
                    }
                    modules.push(done.module);
                }
                continue;
            };
            frame.next += 1;

            let target = match dep.target {
                ResolvedModule::External(name) => {
                    externals.insert(name);
                    continue;
                }
                ResolvedModule::File(target) => target,
            };

            if let Some(start) = stack.iter().position(|f| f.module.id == target) {
                let mut cycle: Vec<String> = stack[start..]
                    .iter()
                    .map(|f| f.module.id.display().to_string())
                    .collect();
                cycle.push(target.display().to_string());
                match self.options.circular_dependency_strategy {
                    CircularDependencyStrategy::Error => {
                        self.count(Counter::LoadFailures);
                        return Err(ModuleError::CircularDependency { cycle });
                    }
                    CircularDependencyStrategy::Warn => {
                        let message = format!("Circular dependency detected: {}", cycle.join(" -> "));
                        warn!("{}", message);
                        warnings.push(message);
                    }
                    CircularDependencyStrategy::Ignore => {}
                }
                continue;
            }
            if !visited.insert(target.clone()) {
                continue;
            }

            let module = self.load_file(&target).await?;
            stack.push(Frame { module, next: 0 });
        }

        Ok(ModuleGraph {
            entry,
            modules,
            externals: externals.into_iter().collect(),
            warnings,
        })
    }

    /// Load one module without its dependencies.
    ///
    /// Concurrent calls for the same path share a single read and compile.
    pub async fn load_file(&self, path: &Path) -> Result<Arc<LoadedModule>> {
        let slot = self.cache.slot(path);
        if let Some(module) = slot.get() {
            self.count(Counter::CacheHits);
            return Ok(module.clone());
        }

        // Only the caller whose initializer runs gets an admission back
        let mut admission = None;
        let result = slot
            .get_or_try_init(|| self.admit_and_compile(path, &mut admission))
            .await
            .cloned();
        match result {
            Ok(module) => {
                if let Some(admission) = admission {
                    self.commit(path, &slot, &module, admission);
                }
                if self.options.cache {
                    self.enforce_cache_limits(path);
                } else {
                    self.cache.remove_slot(path, &slot);
                }
                Ok(module)
            }
            Err(e) => {
                self.cache.remove_slot(path, &slot);
                self.count(Counter::LoadFailures);
                Err(e)
            }
        }
    }

    /// Take limiter capacity, then read and compile behind the path's breaker.
    ///
    /// Capacity is held by guards, so a failed or dropped load gives it back.
    async fn admit_and_compile(
        &self,
        path: &Path,
        admission: &mut Option<Admission>,
    ) -> Result<Arc<LoadedModule>> {
        self.count(Counter::CacheMisses);

        let reservation = match &self.limiter {
            Some(limiter) if self.options.cache => {
                Some(limiter.try_reserve_module().ok_or_else(|| {
                    ModuleError::resource_limit("maxCachedModules", limiter.limits().max_cached_modules)
                })?)
            }
            _ => None,
        };
        let file = match &self.limiter {
            Some(limiter) => Some(limiter.try_open_file().ok_or_else(|| {
                ModuleError::resource_limit("maxFileHandles", limiter.limits().max_file_handles)
            })?),
            None => None,
        };

        let module = match &self.breakers {
            Some(breakers) => {
                let key = path.display().to_string();
                breakers
                    .call(&key, || self.read_and_compile(path, file))
                    .await?
            }
            None => self.read_and_compile(path, file).await?,
        };
        *admission = Some(Admission { reservation });
        Ok(module)
    }

    async fn read_and_compile(&self, path: &Path, file: Option<FileHandle>) -> Result<Arc<LoadedModule>> {
        let started = Instant::now();
        let source = read_source(path, file).await?;
        let options = self.options.compile_options.for_path(path);
        let timeout = options.timeout;
        let compiler = self.compiler.clone();
        let input = source.clone();
        let task = tokio::task::spawn_blocking(move || compiler.compile(&input, &options));
        let output = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ModuleError::load(path, format!("compiler failed: {}", e))),
            Err(_) => {
                return Err(ModuleError::load(
                    path,
                    format!("compilation timed out after {} ms", timeout.as_millis()),
                ));
            }
        };
        if !output.errors.is_empty() {
            return Err(ModuleError::load(path, output.errors.join("; ")));
        }

        let from_dir = path.parent().unwrap_or(path);
        let mut dependencies = Vec::new();
        for specifier in static_requires(&output.code) {
            let target = self
                .resolver
                .resolve(&specifier, from_dir)
                .map_err(|e| ModuleError::load(path, e.to_string()))?;
            dependencies.push(Dependency { specifier, target });
        }

        let module = Arc::new(LoadedModule {
            id: path.to_path_buf(),
            source,
            code: output.code,
            source_map: output.source_map,
            warnings: output.warnings,
            dependencies,
            is_loaded: true,
            loaded_at: SystemTime::now(),
        });
        self.count(Counter::ModulesLoaded);
        if let Some(metrics) = &self.metrics {
            metrics.observe("compile", started.elapsed());
        }
        debug!(
            path = %path.display(),
            dependencies = module.dependencies.len(),
            "Compiled module"
        );
        Ok(module)
    }

    /// Register a freshly compiled module and keep its reservation, unless
    /// its slot was invalidated while it was loading
    fn commit(&self, path: &Path, slot: &ModuleSlot, module: &Arc<LoadedModule>, admission: Admission) {
        if !self.options.cache {
            self.registry.register(module.clone());
            return;
        }
        let Admission { reservation } = admission;
        let committed = self.cache.with_current(path, slot, || {
            self.registry.register(module.clone());
            if let Some(reservation) = reservation {
                reservation.commit();
            }
        });
        if committed.is_none() {
            debug!(path = %path.display(), "Module invalidated while loading; not registered");
        }
    }

    fn enforce_cache_limits(&self, keep: &Path) {
        loop {
            let over_count = self
                .options
                .max_cache_size
                .is_some_and(|max| self.cache.len() as u64 > max);
            let over_memory = self
                .options
                .max_cache_memory
                .is_some_and(|max| self.cache.memory_bytes() > max);
            if !over_count && !over_memory {
                break;
            }
            let Some(victim) = self.cache.oldest_except(keep) else {
                break;
            };
            self.invalidate(&victim.id);
            self.count(Counter::CacheEvictions);
        }
    }

    /// Drop one cached module; returns whether it was cached
    pub fn invalidate(&self, path: &Path) -> bool {
        let Some(module) = self.cache.delete(path) else {
            return false;
        };
        self.forget(&module.id);
        debug!(path = %path.display(), "Module evicted");
        true
    }

    /// Drop every cached module and registry entry; returns how many were cached
    pub fn clear(&self) -> usize {
        let drained = self.cache.drain();
        for module in &drained {
            self.forget(&module.id);
        }
        if !self.options.cache {
            self.registry.clear();
        }
        drained.len()
    }

    /// Unregister a module removed from the cache. Only committed modules
    /// are registered, so only they release a count.
    fn forget(&self, id: &Path) {
        let registered = self.registry.unregister(id).is_some();
        if registered && self.options.cache {
            if let Some(limiter) = &self.limiter {
                limiter.decrement_module_count();
            }
        }
    }
}

/// What the compiling caller holds until its module is committed
struct Admission {
    reservation: Option<ModuleReservation>,
}

async fn read_source(path: &Path, file: Option<FileHandle>) -> Result<String> {
    let result = tokio::fs::read(path).await;
    drop(file);

    let bytes = result.map_err(|e| ModuleError::load(path, e.to_string()))?;
    String::from_utf8(bytes).map_err(|_| ModuleError::load(path, "source is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerSettings;
    use crate::config::ResolutionConfig;
    use crate::resource_limiter::ResourceLimits;
    use somon_compiler::{CompileOutput, SomonCompiler};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts compilations and optionally stalls them
    struct CountingCompiler {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingCompiler {
        fn new() -> Arc<Self> {
            Self::slow(Duration::ZERO)
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Compiler for CountingCompiler {
        fn compile(&self, source: &str, options: &CompileOptions) -> CompileOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            SomonCompiler::new().compile(source, options)
        }
    }

    fn loader_with(compiler: Arc<dyn Compiler>, options: LoaderOptions) -> ModuleLoader {
        ModuleLoader::new(Resolver::new(ResolutionConfig::default()), compiler, options)
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn cycle_project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.som", "воридот \"./b\";\nчоп.сабт(\"a\");");
        write(dir.path(), "b.som", "воридот \"./c\";");
        write(dir.path(), "c.som", "воридот \"./a\";");
        dir
    }

    fn options(strategy: CircularDependencyStrategy) -> LoaderOptions {
        LoaderOptions {
            circular_dependency_strategy: strategy,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_same_path_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        write(dir.path(), "util.som", "содирот собит x = 1;");
        let compiler = CountingCompiler::new();
        let loader = loader_with(compiler.clone(), LoaderOptions::default());

        let first = loader.load("./util", dir.path()).await.unwrap();
        let second = loader.load("./util.som", dir.path()).await.unwrap();
        let third = loader.load("../util", &dir.path().join("sub")).await.unwrap();

        let first = first.module().unwrap();
        assert!(Arc::ptr_eq(first, second.module().unwrap()));
        assert!(Arc::ptr_eq(first, third.module().unwrap()));
        assert_eq!(compiler.calls(), 1);
        assert_eq!(first.dependency_specifiers(), Vec::<&str>::new());
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_compile() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.som", "чоп.сабт(1);");
        let compiler = CountingCompiler::slow(Duration::from_millis(50));
        let loader = loader_with(compiler.clone(), LoaderOptions::default());

        let loads = (0..8).map(|_| loader.load("./main", dir.path()));
        let results = futures::future::join_all(loads).await;
        let modules: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().module().unwrap().clone())
            .collect();
        assert_eq!(compiler.calls(), 1);
        assert!(modules.iter().all(|m| Arc::ptr_eq(m, &modules[0])));
    }

    #[tokio::test]
    async fn test_graph_is_topological() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.som", "воридот { f } аз \"./f\";\nворидот \"./g\";\nворидот fs аз \"fs\";");
        write(dir.path(), "f.som", "воридот \"./g\";\nсодирот функсия f() {}");
        write(dir.path(), "g.som", "чоп.сабт(\"g\");");
        let loader = loader_with(Arc::new(SomonCompiler::new()), LoaderOptions::default());

        let graph = loader.load("./main", dir.path()).await.unwrap().into_graph().unwrap();
        let names: Vec<String> = graph
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["g.som", "f.som", "main.som"]);
        assert_eq!(graph.externals, vec!["fs".to_string()]);
        assert_eq!(graph.entry.dependency_specifiers(), vec!["./f", "./g", "fs"]);
        assert_eq!(loader.registry().len(), 3);
    }

    #[tokio::test]
    async fn test_external_short_circuits() {
        let loader = loader_with(Arc::new(SomonCompiler::new()), LoaderOptions::default());
        let loaded = loader.load("lodash", Path::new("/nowhere")).await.unwrap();
        assert!(matches!(loaded, Loaded::External(ref name) if name == "lodash"));
        assert!(loader.cache().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_warn() {
        let dir = cycle_project();
        let loader = loader_with(
            Arc::new(SomonCompiler::new()),
            options(CircularDependencyStrategy::Warn),
        );
        let graph = loader.load("./a", dir.path()).await.unwrap().into_graph().unwrap();
        assert_eq!(graph.modules.len(), 3);
        assert_eq!(graph.warnings.len(), 1);
        assert!(graph.warnings[0].starts_with("Circular dependency detected:"));
        assert_eq!(loader.registry().find_circular_dependencies().len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_error() {
        let dir = cycle_project();
        let loader = loader_with(
            Arc::new(SomonCompiler::new()),
            options(CircularDependencyStrategy::Error),
        );
        let err = loader.load("./a", dir.path()).await.unwrap_err();
        let ModuleError::CircularDependency { cycle } = err else {
            panic!("expected a cycle error, got {:?}", err);
        };
        assert_eq!(cycle.len(), 4);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[tokio::test]
    async fn test_cycle_ignore() {
        let dir = cycle_project();
        let loader = loader_with(
            Arc::new(SomonCompiler::new()),
            options(CircularDependencyStrategy::Ignore),
        );
        let graph = loader.load("./a", dir.path()).await.unwrap().into_graph().unwrap();
        assert!(graph.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_poison_cache() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "good.som", "чоп.сабт(1);");
        let broken = write(dir.path(), "broken.som", "функсия f( {");
        write(dir.path(), "importer.som", "воридот \"./missing\";");
        let loader = loader_with(Arc::new(SomonCompiler::new()), LoaderOptions::default());

        let err = loader.load("./broken", dir.path()).await.unwrap_err();
        assert!(matches!(err, ModuleError::Load { ref path, .. } if path.ends_with("broken.som")));
        let err = loader.load("./importer", dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("Cannot resolve module './missing'"));
        assert!(matches!(
            loader.load("./absent", dir.path()).await,
            Err(ModuleError::Resolution { .. })
        ));

        assert!(loader.load("./good", dir.path()).await.is_ok());
        assert_eq!(loader.cache().len(), 1);

        // Fixing the file is picked up on the next load
        fs::write(&broken, "функсия f() {}").unwrap();
        assert!(loader.load("./broken", dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cache_disabled_recompiles() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.som", "чоп.сабт(1);");
        let compiler = CountingCompiler::new();
        let loader = loader_with(
            compiler.clone(),
            LoaderOptions {
                cache: false,
                ..Default::default()
            },
        );
        loader.load("./main", dir.path()).await.unwrap();
        loader.load("./main", dir.path()).await.unwrap();
        assert_eq!(compiler.calls(), 2);
        assert!(loader.cache().is_empty());
    }

    #[tokio::test]
    async fn test_max_cache_size_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.som", "b.som", "c.som"] {
            write(dir.path(), name, "чоп.сабт(1);");
        }
        let limiter = Arc::new(ResourceLimiter::new(ResourceLimits::default()));
        let loader = loader_with(
            Arc::new(SomonCompiler::new()),
            LoaderOptions {
                max_cache_size: Some(2),
                ..Default::default()
            },
        )
        .with_resource_limiter(limiter.clone());

        for name in ["./a", "./b", "./c"] {
            loader.load(name, dir.path()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(loader.cache().len(), 2);
        assert_eq!(limiter.module_count(), 2);
        assert!(!loader.cache().has(&dir.path().canonicalize().unwrap().join("a.som")));
        assert_eq!(loader.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_module_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.som", "");
        write(dir.path(), "b.som", "");
        let limiter = Arc::new(ResourceLimiter::new(ResourceLimits {
            max_cached_modules: 1,
            ..Default::default()
        }));
        let loader = loader_with(Arc::new(SomonCompiler::new()), LoaderOptions::default())
            .with_resource_limiter(limiter.clone());

        loader.load("./a", dir.path()).await.unwrap();
        let err = loader.load("./b", dir.path()).await.unwrap_err();
        assert!(matches!(err, ModuleError::ResourceLimitExceeded { ref resource, limit: 1 } if resource == "maxCachedModules"));
        assert_eq!(limiter.file_handle_count(), 0);

        assert_eq!(loader.clear(), 1);
        assert_eq!(limiter.module_count(), 0);
        assert!(loader.load("./b", dir.path()).await.is_ok());
    }

    fn limited(modules: u64, files: u64) -> Arc<ResourceLimiter> {
        Arc::new(ResourceLimiter::new(ResourceLimits {
            max_cached_modules: modules,
            max_file_handles: files,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_dropped_load_releases_capacity() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.som", "чоп.сабт(1);");
        let limiter = limited(1, 1);
        let loader = loader_with(CountingCompiler::slow(Duration::from_millis(50)), LoaderOptions::default())
            .with_resource_limiter(limiter.clone());

        let mut load = Box::pin(loader.load("./a", dir.path()));
        assert!(futures::poll!(&mut load).is_pending());
        drop(load);
        assert_eq!(limiter.file_handle_count(), 0);
        assert_eq!(limiter.module_count(), 0);
        assert!(loader.cache().is_empty());

        loader.load("./a", dir.path()).await.unwrap();
        assert_eq!(limiter.module_count(), 1);
        assert_eq!(limiter.file_handle_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_loads_respect_module_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.som", "b.som", "c.som", "d.som"] {
            write(dir.path(), name, "чоп.сабт(1);");
        }
        let limiter = limited(1, 16);
        let loader = loader_with(CountingCompiler::slow(Duration::from_millis(30)), LoaderOptions::default())
            .with_resource_limiter(limiter.clone());

        let loads = ["./a", "./b", "./c", "./d"]
            .iter()
            .map(|specifier| loader.load(specifier, dir.path()));
        let results = futures::future::join_all(loads).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
            e,
            ModuleError::ResourceLimitExceeded { resource, .. } if resource == "maxCachedModules"
        )));
        assert_eq!(limiter.module_count(), 1);
        assert_eq!(loader.cache().len(), 1);
        assert_eq!(loader.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_during_load_leaves_nothing_counted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.som", "чоп.сабт(1);");
        let limiter = limited(10, 10);
        let loader = Arc::new(
            loader_with(CountingCompiler::slow(Duration::from_millis(100)), LoaderOptions::default())
                .with_resource_limiter(limiter.clone()),
        );

        let task = {
            let loader = loader.clone();
            let dir = dir.path().to_path_buf();
            tokio::spawn(async move { loader.load("./a", &dir).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(loader.clear(), 0);
        task.await.unwrap().unwrap();

        assert_eq!(limiter.module_count(), 0);
        assert!(loader.cache().is_empty());
        assert!(loader.registry().is_empty());

        // A later load is counted normally
        loader.load("./a", dir.path()).await.unwrap();
        assert_eq!(limiter.module_count(), 1);
        assert_eq!(loader.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_full_cache_does_not_trip_breaker() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.som", "");
        write(dir.path(), "b.som", "");
        let breakers = Arc::new(CircuitBreakerManager::new(BreakerSettings {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }));
        let loader = loader_with(Arc::new(SomonCompiler::new()), LoaderOptions::default())
            .with_resource_limiter(limited(1, 10))
            .with_circuit_breakers(breakers.clone());

        loader.load("./a", dir.path()).await.unwrap();
        for _ in 0..2 {
            assert!(matches!(
                loader.load("./b", dir.path()).await,
                Err(ModuleError::ResourceLimitExceeded { .. })
            ));
        }
        assert_eq!(breakers.get_overall_health().open, 0);

        loader.clear();
        assert!(loader.load("./b", dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_breaker_stops_touching_failing_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken.som", "'unterminated");
        let compiler = CountingCompiler::new();
        let breakers = Arc::new(CircuitBreakerManager::new(BreakerSettings {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }));
        let loader = loader_with(compiler.clone(), LoaderOptions::default())
            .with_circuit_breakers(breakers.clone());

        for _ in 0..2 {
            assert!(matches!(
                loader.load("./broken", dir.path()).await,
                Err(ModuleError::Load { .. })
            ));
        }
        assert!(matches!(
            loader.load("./broken", dir.path()).await,
            Err(ModuleError::CircuitBreakerOpen { .. })
        ));
        assert_eq!(compiler.calls(), 2);
        assert_eq!(breakers.get_overall_health().open, 1);
    }

    #[tokio::test]
    async fn test_compile_timeout() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.som", "");
        let mut options = LoaderOptions::default();
        options.compile_options.timeout = Duration::from_millis(20);
        let loader = loader_with(CountingCompiler::slow(Duration::from_millis(300)), options);

        let err = loader.load("./main", dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("compilation timed out after 20 ms"));
        assert!(loader.cache().is_empty());
    }

    #[tokio::test]
    async fn test_json_modules() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "data.json", "{\"greeting\": \"салом\"}");
        write(dir.path(), "main.som", "собит д = require(\"./data.json\");");
        let loader = loader_with(Arc::new(SomonCompiler::new()), LoaderOptions::default());
        let graph = loader.load("./main", dir.path()).await.unwrap().into_graph().unwrap();
        assert_eq!(graph.modules[0].code, "module.exports = {\"greeting\": \"салом\"};");
    }
}
