// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module path resolution

use crate::config::ResolutionConfig;
use crate::error::{ModuleError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Result of module resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedModule {
    /// Canonical path of a local file
    File(PathBuf),
    /// Bare specifier left to the host runtime
    External(String),
}

impl ResolvedModule {
    /// Whether this is an external library
    pub fn is_external_library(&self) -> bool {
        matches!(self, ResolvedModule::External(_))
    }

    /// The resolved file, if local
    pub fn path(&self) -> Option<&Path> {
        match self {
            ResolvedModule::File(path) => Some(path),
            ResolvedModule::External(_) => None,
        }
    }
}

/// Kind of specifier, decided from its spelling alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierKind {
    /// `./x`, `../x`
    Relative,
    /// `/x`
    Absolute,
    /// `fs`, `@scope/pkg`, aliases
    Bare,
}

impl SpecifierKind {
    /// Classify a specifier
    pub fn of(specifier: &str) -> Self {
        if specifier == "."
            || specifier == ".."
            || specifier.starts_with("./")
            || specifier.starts_with("../")
        {
            SpecifierKind::Relative
        } else if Path::new(specifier).is_absolute() {
            SpecifierKind::Absolute
        } else {
            SpecifierKind::Bare
        }
    }
}

/// Stateless resolver; every call consults the file system afresh
#[derive(Debug, Clone)]
pub struct Resolver {
    config: ResolutionConfig,
    extensions: Vec<String>,
}

impl Resolver {
    /// Create a resolver for a configuration
    pub fn new(config: ResolutionConfig) -> Self {
        let extensions = config
            .extensions
            .iter()
            .filter(|ext| extension_allowed(&config, ext.trim_start_matches('.')))
            .cloned()
            .collect();
        Self { config, extensions }
    }

    /// Extensions tried, in order, after `allowJs`/`resolveJsonModule` filtering
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Resolve `specifier` as written in a module located in `from_dir`
    pub fn resolve(&self, specifier: &str, from_dir: &Path) -> Result<ResolvedModule> {
        let resolved = match SpecifierKind::of(specifier) {
            SpecifierKind::Relative => self.resolve_path(&from_dir.join(specifier)),
            SpecifierKind::Absolute => self.resolve_path(Path::new(specifier)),
            SpecifierKind::Bare => return self.resolve_bare(specifier, from_dir),
        };
        trace!(specifier, from = %from_dir.display(), ?resolved, "resolve");
        resolved
            .map(ResolvedModule::File)
            .ok_or_else(|| ModuleError::resolution(specifier, from_dir))
    }

    /// Lexical location a specifier points at, used to key failures before
    /// the file is known to exist
    pub fn lexical_key(specifier: &str, from_dir: &Path) -> String {
        match SpecifierKind::of(specifier) {
            SpecifierKind::Bare => specifier.to_string(),
            _ => normalize(&from_dir.join(specifier)).display().to_string(),
        }
    }

    fn resolve_bare(&self, specifier: &str, from_dir: &Path) -> Result<ResolvedModule> {
        if let Some(targets) = self.alias_targets(specifier) {
            let base = self.config.base_url.as_deref().unwrap_or(from_dir);
            let base = if base.is_absolute() {
                base.to_path_buf()
            } else {
                from_dir.join(base)
            };
            for target in &targets {
                if let Some(path) = self.resolve_path(&base.join(target)) {
                    return Ok(ResolvedModule::File(path));
                }
            }
            return Err(ModuleError::resolution(specifier, from_dir));
        }

        for dir in &self.config.module_directories {
            for ancestor in from_dir.ancestors() {
                if let Some(path) = self.resolve_path(&ancestor.join(dir).join(specifier)) {
                    return Ok(ResolvedModule::File(path));
                }
            }
        }

        Ok(ResolvedModule::External(specifier.to_string()))
    }

    /// Targets of the first `paths` alias matching `specifier`, wildcards substituted
    fn alias_targets(&self, specifier: &str) -> Option<Vec<String>> {
        // Exact aliases win over wildcard ones; longer prefixes win among wildcards
        if let Some(targets) = self.config.paths.get(specifier) {
            if !specifier.contains('*') {
                return Some(targets.clone());
            }
        }

        let mut best: Option<(usize, &str, &Vec<String>)> = None;
        for (pattern, targets) in &self.config.paths {
            let Some((prefix, suffix)) = pattern.split_once('*') else {
                continue;
            };
            if specifier.len() >= prefix.len() + suffix.len()
                && specifier.starts_with(prefix)
                && specifier.ends_with(suffix)
            {
                let captured = &specifier[prefix.len()..specifier.len() - suffix.len()];
                if best.is_none_or(|(len, _, _)| prefix.len() > len) {
                    best = Some((prefix.len(), captured, targets));
                }
            }
        }
        best.map(|(_, captured, targets)| {
            targets
                .iter()
                .map(|target| target.replacen('*', captured, 1))
                .collect()
        })
    }

    /// Literal path, then each extension, then `index` files, first hit wins.
    fn resolve_path(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() && self.literal_allowed(path) {
            return canonical(path);
        }

        if let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) {
            for ext in &self.extensions {
                let candidate = path.with_file_name(format!("{}{}", file_name, ext));
                if candidate.is_file() {
                    return canonical(&candidate);
                }
            }
        }

        if path.is_dir() {
            for ext in &self.extensions {
                let index = path.join(format!("index{}", ext));
                if index.is_file() {
                    return canonical(&index);
                }
            }
        }
        None
    }

    fn literal_allowed(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => extension_allowed(&self.config, ext),
            None => true,
        }
    }
}

fn extension_allowed(config: &ResolutionConfig, ext: &str) -> bool {
    match ext {
        "js" | "cjs" | "mjs" => config.allow_js,
        "json" => config.resolve_json_module,
        _ => true,
    }
}

fn canonical(path: &Path) -> Option<PathBuf> {
    std::fs::canonicalize(path).ok()
}

/// Removes `.` and `..` components without touching the file system.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
