// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Passive index over loaded modules and their dependency edges

use crate::module_system::cache::LoadedModule;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Aggregate registry figures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatistics {
    /// Registered modules
    pub total_modules: usize,
    /// Dependency edges, external ones included
    pub total_dependencies: usize,
    /// Edges to external libraries
    pub external_dependencies: usize,
    /// Distinct cycles
    pub circular_dependency_count: usize,
}

/// A dependency whose target file no longer exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    /// Importing module
    pub from: PathBuf,
    /// Specifier as written
    pub specifier: String,
    /// Path it resolved to when loaded
    pub target: PathBuf,
}

/// Module registry
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: DashMap<PathBuf, Arc<LoadedModule>>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a module, replacing any earlier version
    pub fn register(&self, module: Arc<LoadedModule>) {
        self.modules.insert(module.id.clone(), module);
    }

    /// Forget a module
    pub fn unregister(&self, id: &Path) -> Option<Arc<LoadedModule>> {
        self.modules.remove(id).map(|(_, m)| m)
    }

    /// Look up a module
    pub fn get(&self, id: &Path) -> Option<Arc<LoadedModule>> {
        self.modules.get(id).map(|m| m.clone())
    }

    /// Dependency specifiers of a module, in source order
    pub fn get_dependencies(&self, id: &Path) -> Option<Vec<String>> {
        self.modules.get(id).map(|m| {
            m.dependencies
                .iter()
                .map(|d| d.specifier.clone())
                .collect()
        })
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<PathBuf> {
        let mut ids: Vec<PathBuf> = self.modules.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered modules
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Forget every module
    pub fn clear(&self) {
        self.modules.clear();
    }

    /// Adjacency between registered modules, deterministic order
    fn adjacency(&self) -> BTreeMap<PathBuf, Vec<PathBuf>> {
        let modules: Vec<Arc<LoadedModule>> = self.modules.iter().map(|e| e.value().clone()).collect();
        let ids: HashSet<&Path> = modules.iter().map(|m| m.id.as_path()).collect();
        modules
            .iter()
            .map(|module| {
                let targets = module
                    .local_dependencies()
                    .filter(|target| ids.contains(target))
                    .map(Path::to_path_buf)
                    .collect();
                (module.id.clone(), targets)
            })
            .collect()
    }

    /// Every distinct cycle.
    ///
    /// Each cycle lists its modules starting from the smallest id; the last
    /// module depends on the first.
    pub fn find_circular_dependencies(&self) -> Vec<Vec<PathBuf>> {
        let graph = self.adjacency();
        let mut cycles = Vec::new();
        let mut seen = HashSet::new();
        let mut visited: HashSet<&PathBuf> = HashSet::new();

        for root in graph.keys() {
            if !visited.insert(root) {
                continue;
            }
            // Modules on the current path, each with the index of its next edge
            let mut stack: Vec<(&PathBuf, usize)> = vec![(root, 0)];
            let mut on_path: HashMap<&PathBuf, usize> = HashMap::from([(root, 0)]);
            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };
                let Some(target) = graph.get(frame.0).and_then(|targets| targets.get(frame.1)) else {
                    if let Some((id, _)) = stack.pop() {
                        on_path.remove(id);
                    }
                    continue;
                };
                frame.1 += 1;

                if let Some(&start) = on_path.get(target) {
                    let path: Vec<&PathBuf> = stack[start..].iter().map(|(id, _)| *id).collect();
                    let cycle = canonical_rotation(&path);
                    if seen.insert(cycle.clone()) {
                        cycles.push(cycle);
                    }
                    continue;
                }
                if visited.insert(target) {
                    on_path.insert(target, stack.len());
                    stack.push((target, 0));
                }
            }
        }
        cycles
    }

    /// Dependencies whose resolved file is gone from disk or was never loaded
    pub fn find_missing_dependencies(&self) -> Vec<MissingDependency> {
        let mut missing = Vec::new();
        for id in self.ids() {
            let Some(module) = self.get(&id) else {
                continue;
            };
            for dep in &module.dependencies {
                if let Some(target) = dep.target.path() {
                    if !target.is_file() {
                        missing.push(MissingDependency {
                            from: id.clone(),
                            specifier: dep.specifier.clone(),
                            target: target.to_path_buf(),
                        });
                    }
                }
            }
        }
        missing
    }

    /// Aggregate figures
    pub fn get_statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics {
            total_modules: self.modules.len(),
            ..Default::default()
        };
        for entry in self.modules.iter() {
            for dep in &entry.value().dependencies {
                stats.total_dependencies += 1;
                if dep.target.is_external_library() {
                    stats.external_dependencies += 1;
                }
            }
        }
        stats.circular_dependency_count = self.find_circular_dependencies().len();
        stats
    }
}

fn canonical_rotation(cycle: &[&PathBuf]) -> Vec<PathBuf> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, p)| **p)
        .map_or(0, |(i, _)| i);
    cycle[start..]
        .iter()
        .chain(&cycle[..start])
        .map(|p| (*p).clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_system::cache::Dependency;
    use crate::module_system::resolver::ResolvedModule;
    use std::time::SystemTime;

    fn module(id: &str, deps: &[&str]) -> Arc<LoadedModule> {
        Arc::new(LoadedModule {
            id: PathBuf::from(id),
            source: String::new(),
            code: String::new(),
            source_map: None,
            warnings: Vec::new(),
            dependencies: deps
                .iter()
                .map(|d| Dependency {
                    specifier: d.to_string(),
                    target: if d.starts_with('/') {
                        ResolvedModule::File(PathBuf::from(d))
                    } else {
                        ResolvedModule::External(d.to_string())
                    },
                })
                .collect(),
            is_loaded: true,
            loaded_at: SystemTime::now(),
        })
    }

    #[test]
    fn test_three_module_cycle_found_once() {
        let registry = ModuleRegistry::new();
        registry.register(module("/b", &["/c"]));
        registry.register(module("/a", &["/b", "fs"]));
        registry.register(module("/c", &["/a"]));

        let cycles = registry.find_circular_dependencies();
        assert_eq!(
            cycles,
            vec![vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]]
        );

        let stats = registry.get_statistics();
        assert_eq!(stats.total_modules, 3);
        assert_eq!(stats.total_dependencies, 4);
        assert_eq!(stats.external_dependencies, 1);
        assert_eq!(stats.circular_dependency_count, 1);
    }

    #[test]
    fn test_distinct_cycles() {
        let registry = ModuleRegistry::new();
        registry.register(module("/a", &["/b", "/a"]));
        registry.register(module("/b", &["/a"]));
        registry.register(module("/c", &["/d"]));
        registry.register(module("/d", &[]));
        let cycles = registry.find_circular_dependencies();
        assert_eq!(cycles.len(), 2);
        assert!(cycles.contains(&vec![PathBuf::from("/a")]));
        assert!(cycles.contains(&vec![PathBuf::from("/a"), PathBuf::from("/b")]));
    }

    #[test]
    fn test_acyclic_graph() {
        let registry = ModuleRegistry::new();
        registry.register(module("/a", &["/b", "/c"]));
        registry.register(module("/b", &["/c"]));
        registry.register(module("/c", &[]));
        assert!(registry.find_circular_dependencies().is_empty());
        assert_eq!(
            registry.get_dependencies(Path::new("/a")),
            Some(vec!["/b".to_string(), "/c".to_string()])
        );
    }

    #[test]
    fn test_long_chain_closing_on_itself() {
        let registry = ModuleRegistry::new();
        let depth = 10_000;
        let name = |i: usize| format!("/m{:05}", i);
        for i in 0..depth {
            let next = name((i + 1) % depth);
            registry.register(module(&name(i), &[next.as_str()]));
        }

        let cycles = registry.find_circular_dependencies();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), depth);
        assert_eq!(cycles[0][0], PathBuf::from("/m00000"));
    }

    #[test]
    fn test_missing_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.som");
        std::fs::write(&present, "").unwrap();
        let gone = dir.path().join("gone.som");

        let registry = ModuleRegistry::new();
        registry.register(module(
            "/main",
            &[present.to_str().unwrap(), gone.to_str().unwrap(), "fs"],
        ));
        let missing = registry.find_missing_dependencies();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].target, gone);
    }

    #[test]
    fn test_unregister_and_clear() {
        let registry = ModuleRegistry::new();
        registry.register(module("/a", &[]));
        registry.register(module("/b", &[]));
        assert!(registry.unregister(Path::new("/a")).is_some());
        assert_eq!(registry.ids(), vec![PathBuf::from("/b")]);
        registry.clear();
        assert!(registry.is_empty());
    }
}
