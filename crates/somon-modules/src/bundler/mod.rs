// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Single-file CommonJS bundles
//!
//! Module ids inside a bundle are paths relative to the directory of the
//! entry point, so identical sources produce identical bundles no matter
//! where they live on disk or where the bundler is invoked from.

mod runtime;
pub mod source_map;

pub use runtime::{quote, render, BundledModule};
pub use source_map::{SourceMap, SourceMapBuilder};

use crate::error::{ModuleError, Result};
use crate::module_system::{LoadedModule, ModuleLoader, ResolvedModule};
use somon_compiler::{extract_requires, Minifier, RequireArgument, WhitespaceMinifier};
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// The only supported output format
pub const COMMONJS: &str = "commonjs";

/// What to bundle and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRequest {
    /// Entry module
    pub entry_point: PathBuf,
    /// Output format; only `commonjs`
    pub format: String,
    /// Minify the output
    pub minify: bool,
    /// Produce a source map
    pub source_maps: bool,
    /// Embed original sources in the source map
    pub inline_sources: bool,
    /// Bare specifiers left for the host to resolve
    pub externals: BTreeSet<String>,
}

impl BundleRequest {
    /// A plain CommonJS bundle of `entry_point`
    pub fn new(entry_point: impl Into<PathBuf>) -> Self {
        Self {
            entry_point: entry_point.into(),
            format: COMMONJS.to_string(),
            minify: false,
            source_maps: false,
            inline_sources: false,
            externals: BTreeSet::new(),
        }
    }

    /// Leave `specifier` to the host's `require`
    pub fn external(mut self, specifier: impl Into<String>) -> Self {
        self.externals.insert(specifier.into());
        self
    }
}

/// A finished bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Bundle text
    pub code: String,
    /// Serialized source map
    pub map: Option<String>,
}

/// Bundler
pub struct Bundler {
    loader: Arc<ModuleLoader>,
    minifier: Arc<dyn Minifier>,
}

impl std::fmt::Debug for Bundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundler").finish_non_exhaustive()
    }
}

impl Bundler {
    /// Create a bundler on top of a loader
    pub fn new(loader: Arc<ModuleLoader>) -> Self {
        Self {
            loader,
            minifier: Arc::new(WhitespaceMinifier),
        }
    }

    /// Use a different minifier
    pub fn with_minifier(mut self, minifier: Arc<dyn Minifier>) -> Self {
        self.minifier = minifier;
        self
    }

    /// Build a bundle
    pub async fn bundle(&self, request: &BundleRequest) -> Result<Bundle> {
        if request.format != COMMONJS {
            return Err(ModuleError::bundle(format!(
                "Unsupported bundle format '{}'; only '{}' is supported",
                request.format, COMMONJS
            )));
        }

        let entry = tokio::fs::canonicalize(&request.entry_point)
            .await
            .map_err(|_| {
                let from = request
                    .entry_point
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                ModuleError::resolution(request.entry_point.display().to_string(), &from)
            })?;
        let root = entry
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ModuleError::bundle("entry point has no parent directory"))?;

        let graph = self.loader.load_graph(&entry).await?;
        for warning in &graph.warnings {
            debug!(warning = %warning, "Bundling despite warning");
        }

        let mut ids = HashMap::new();
        for module in &graph.modules {
            ids.insert(module.id.clone(), bundle_id(&root, &module.id)?);
        }

        let mut bundled = Vec::with_capacity(graph.modules.len());
        for module in &graph.modules {
            let id = ids[&module.id].clone();
            let code = rewrite_requires(module, &id, &ids, &request.externals)?;
            bundled.push(BundledModule { id, code });
        }

        let entry_id = ids[&graph.entry.id].clone();
        let rendered = render(&bundled, &entry_id);

        let code = if request.minify {
            let minifier = self.minifier.clone();
            let text = rendered.code.clone();
            tokio::task::spawn_blocking(move || minifier.minify(&text))
                .await
                .map_err(|e| ModuleError::bundle(format!("minification failed: {}", e)))?
                .map_err(|e| ModuleError::bundle(format!("minification failed: {}", e)))?
        } else {
            rendered.code
        };

        let map = if request.source_maps {
            let mut builder = SourceMapBuilder::new();
            for ((module, bundled), start) in graph.modules.iter().zip(&bundled).zip(&rendered.start_lines) {
                let source = builder.add_source(bundled.id.clone(), module.source.clone());
                let lines = bundled.code.matches('\n').count() + 1;
                for line in 0..lines {
                    builder.map_line(start + line, source, line);
                }
            }
            Some(serde_json::to_string(&builder.build(request.inline_sources))?)
        } else {
            None
        };

        info!(
            entry = %entry_id,
            modules = bundled.len(),
            externals = graph.externals.len(),
            bytes = code.len(),
            "Bundle created"
        );
        Ok(Bundle { code, map })
    }
}

/// Id of `path` within a bundle rooted at `root`, always with `/` separators
pub fn bundle_id(root: &Path, path: &Path) -> Result<String> {
    let relative = pathdiff::diff_paths(path, root).ok_or_else(|| {
        ModuleError::bundle(format!("cannot place '{}' in the bundle", path.display()))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::ParentDir => "..".to_string(),
            other => other.as_os_str().to_string_lossy().into_owned(),
        })
        .collect();
    let joined = parts.join("/");
    if joined.starts_with("../") {
        Ok(joined)
    } else {
        Ok(format!("./{}", joined))
    }
}

fn rewrite_requires(
    module: &LoadedModule,
    id: &str,
    ids: &HashMap<PathBuf, String>,
    externals: &BTreeSet<String>,
) -> Result<String> {
    let code = &module.code;
    let mut out = String::with_capacity(code.len());
    let mut last = 0;

    for call in extract_requires(code) {
        let specifier = match &call.argument {
            RequireArgument::Literal(specifier) => specifier,
            RequireArgument::Dynamic => {
                return Err(ModuleError::bundle(format!(
                    "Dynamic require expressions are not supported ({}:{}:{})",
                    id, call.line, call.column
                )));
            }
            RequireArgument::TemplateWithSubstitutions => {
                return Err(ModuleError::bundle(format!(
                    "Dynamic template literal require expressions are not supported ({}:{}:{})",
                    id, call.line, call.column
                )));
            }
        };

        let target = module
            .dependencies
            .iter()
            .find(|d| &d.specifier == specifier)
            .map(|d| &d.target);
        match target {
            Some(ResolvedModule::File(path)) => {
                let target_id = ids.get(path).ok_or_else(|| {
                    ModuleError::bundle(format!("'{}' required from {} was not loaded", specifier, id))
                })?;
                out.push_str(&code[last..call.argument_span.start]);
                out.push_str(&quote(target_id));
                last = call.argument_span.end;
            }
            Some(ResolvedModule::External(name)) if externals.contains(name) => {}
            Some(ResolvedModule::External(name)) => {
                return Err(ModuleError::bundle(format!(
                    "'{}' required from {} is neither a local module nor a declared external",
                    name, id
                )));
            }
            None => {
                return Err(ModuleError::bundle(format!(
                    "'{}' required from {} was never resolved",
                    specifier, id
                )));
            }
        }
    }

    out.push_str(&code[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionConfig;
    use crate::module_system::{LoaderOptions, Resolver};
    use somon_compiler::SomonCompiler;
    use std::fs;

    fn bundler() -> Bundler {
        let loader = ModuleLoader::new(
            Resolver::new(ResolutionConfig::default()),
            Arc::new(SomonCompiler::new()),
            LoaderOptions::default(),
        );
        Bundler::new(Arc::new(loader))
    }

    #[test]
    fn test_bundle_ids() {
        let root = Path::new("/work/app");
        assert_eq!(bundle_id(root, Path::new("/work/app/main.som")).unwrap(), "./main.som");
        assert_eq!(bundle_id(root, Path::new("/work/app/lib/x.som")).unwrap(), "./lib/x.som");
        assert_eq!(bundle_id(root, Path::new("/work/shared/y.som")).unwrap(), "../shared/y.som");
    }

    #[tokio::test]
    async fn test_requires_rewritten_to_bundle_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/math.som"), "содирот функсия ду(x) { бозгашт x * 2; }").unwrap();
        fs::write(
            dir.path().join("main.som"),
            "воридот { ду } аз \"./lib/math\";\nворидот path аз \"path\";\nчоп.сабт(ду(2));",
        )
        .unwrap();

        let request = BundleRequest::new(dir.path().join("main.som")).external("path");
        let bundle = bundler().bundle(&request).await.unwrap();
        assert!(bundle.code.contains("require(\"./lib/math.som\")"));
        assert!(bundle.code.contains("require(\"path\")"));
        assert!(bundle.code.contains("\"./lib/math.som\": function (module, exports, require) {"));
        assert!(bundle.code.ends_with("}, \"./main.som\");\n"));
        assert!(bundle.map.is_none());
    }

    #[tokio::test]
    async fn test_undeclared_external_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.som"), "воридот lodash аз \"lodash\";").unwrap();
        let err = bundler()
            .bundle(&BundleRequest::new(dir.path().join("main.som")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'lodash'"));
    }

    #[tokio::test]
    async fn test_source_map_points_at_original_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.som"), "собит а = 1;\nчоп.сабт(а);").unwrap();
        let request = BundleRequest {
            source_maps: true,
            ..BundleRequest::new(dir.path().join("main.som"))
        };
        let bundle = bundler().bundle(&request).await.unwrap();
        let map: SourceMap = serde_json::from_str(bundle.map.as_deref().unwrap()).unwrap();
        assert_eq!(map.sources, vec!["./main.som"]);
        assert!(map.sources_content.is_none());

        let lines: Vec<&str> = bundle.code.lines().collect();
        let mapped: Vec<usize> = map
            .mappings
            .split(';')
            .enumerate()
            .filter(|(_, segment)| !segment.is_empty())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(mapped.len(), 2);
        assert_eq!(lines[mapped[0]], "const а = 1;");
        assert_eq!(lines[mapped[1]], "console.log(а);");
    }

    #[tokio::test]
    async fn test_minified_bundle_keeps_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.som"), "// салом\nчоп.сабт( 1 + 2 );").unwrap();
        let plain = bundler()
            .bundle(&BundleRequest::new(dir.path().join("main.som")))
            .await
            .unwrap();
        let minified = bundler()
            .bundle(&BundleRequest {
                minify: true,
                ..BundleRequest::new(dir.path().join("main.som"))
            })
            .await
            .unwrap();
        assert!(minified.code.len() < plain.code.len());
        assert!(!minified.code.contains("салом"));
        assert_eq!(minified.code.lines().count(), plain.code.lines().count());
    }
}
