// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Compiled module cache

use crate::module_system::resolver::ResolvedModule;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::OnceCell;

/// A statically declared dependency of a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Specifier as written in the generated code
    pub specifier: String,
    /// Where it resolved when the module was loaded
    pub target: ResolvedModule,
}

/// A compiled module
#[derive(Debug, Clone)]
pub struct LoadedModule {
    /// Canonical path of the source file
    pub id: PathBuf,
    /// Original source text
    pub source: String,
    /// Generated JavaScript
    pub code: String,
    /// Source map produced by the compiler, if any
    pub source_map: Option<String>,
    /// Compiler warnings
    pub warnings: Vec<String>,
    /// Dependencies in source order
    pub dependencies: Vec<Dependency>,
    /// Whether compilation finished
    pub is_loaded: bool,
    /// When the module was compiled
    pub loaded_at: SystemTime,
}

impl LoadedModule {
    /// Dependency specifiers in source order
    pub fn dependency_specifiers(&self) -> Vec<&str> {
        self.dependencies.iter().map(|d| d.specifier.as_str()).collect()
    }

    /// Local files this module depends on
    pub fn local_dependencies(&self) -> impl Iterator<Item = &Path> {
        self.dependencies.iter().filter_map(|d| d.target.path())
    }

    /// Approximate memory held by this module
    pub fn size_bytes(&self) -> u64 {
        (self.source.len() + self.code.len() + self.source_map.as_ref().map_or(0, String::len))
            as u64
    }
}

/// Slot for one path: empty while its load is in flight, set once it completes.
pub(crate) type ModuleSlot = Arc<OnceCell<Arc<LoadedModule>>>;

/// Thread-safe module cache with one slot per canonical path
#[derive(Debug, Default)]
pub struct ModuleCache {
    slots: DashMap<PathBuf, ModuleSlot>,
}

impl ModuleCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `path`, created empty if absent
    pub(crate) fn slot(&self, path: &Path) -> ModuleSlot {
        if let Some(slot) = self.slots.get(path) {
            return slot.clone();
        }
        self.slots
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Remove `path` only if it still maps to `slot`
    pub(crate) fn remove_slot(&self, path: &Path, slot: &ModuleSlot) -> bool {
        self.slots
            .remove_if(path, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
    }

    /// Run `f` only while `path` still maps to `slot`. Removal of `path`
    /// waits until `f` returns.
    pub(crate) fn with_current<R>(
        &self,
        path: &Path,
        slot: &ModuleSlot,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        let current = self.slots.get(path)?;
        Arc::ptr_eq(current.value(), slot).then(f)
    }

    /// Get a completed module by path
    pub fn get(&self, path: &Path) -> Option<Arc<LoadedModule>> {
        self.slots.get(path).and_then(|slot| slot.get().cloned())
    }

    /// Check if a completed module is cached
    pub fn has(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Remove a module from the cache, returning it if it had completed
    pub fn delete(&self, path: &Path) -> Option<Arc<LoadedModule>> {
        self.slots
            .remove(path)
            .and_then(|(_, slot)| slot.get().cloned())
    }

    /// Remove every entry, returning the completed modules
    pub fn drain(&self) -> Vec<Arc<LoadedModule>> {
        let paths: Vec<PathBuf> = self.slots.iter().map(|e| e.key().clone()).collect();
        paths.iter().filter_map(|p| self.delete(p)).collect()
    }

    /// All completed modules
    pub fn modules(&self) -> Vec<Arc<LoadedModule>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.value().get().cloned())
            .collect()
    }

    /// Number of completed modules
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value().initialized()).count()
    }

    /// Check if no module has completed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by completed modules
    pub fn memory_bytes(&self) -> u64 {
        self.modules().iter().map(|m| m.size_bytes()).sum()
    }

    /// Completed module with the oldest `loaded_at`, other than `keep`
    pub fn oldest_except(&self, keep: &Path) -> Option<Arc<LoadedModule>> {
        self.modules()
            .into_iter()
            .filter(|m| m.id != keep)
            .min_by_key(|m| m.loaded_at)
    }
}
