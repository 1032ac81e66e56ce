// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module system configuration (`somon.json`)
//!
//! Configuration is validated as a whole before anything starts: every
//! violation is collected and reported together in one
//! [`ModuleError::Configuration`].

use crate::error::{ModuleError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use somon_compiler::{CompileOptions, Target};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when the import graph contains a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircularDependencyStrategy {
    /// Reject the load
    Error,
    /// Record a warning and continue
    #[default]
    Warn,
    /// Continue silently
    Ignore,
}

/// Output language version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationTarget {
    /// ECMAScript 5
    Es5,
    /// ECMAScript 2015
    Es2015,
    /// ECMAScript 2020
    #[default]
    Es2020,
    /// Latest features
    EsNext,
}

impl From<CompilationTarget> for Target {
    fn from(target: CompilationTarget) -> Self {
        match target {
            CompilationTarget::Es5 => Target::Es5,
            CompilationTarget::Es2015 => Target::Es2015,
            CompilationTarget::Es2020 => Target::Es2020,
            CompilationTarget::EsNext => Target::EsNext,
        }
    }
}

/// How specifiers map to files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolutionConfig {
    /// Directory that `paths` targets are relative to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<PathBuf>,
    /// Alias patterns (`"@lib/*"`) to target patterns (`["src/lib/*"]`)
    pub paths: BTreeMap<String, Vec<String>>,
    /// Extensions to try, in order
    pub extensions: Vec<String>,
    /// Directory names searched upwards for bare specifiers
    pub module_directories: Vec<String>,
    /// Whether `.js` files may be resolved
    pub allow_js: bool,
    /// Whether `.json` files may be resolved
    pub resolve_json_module: bool,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            paths: BTreeMap::new(),
            extensions: vec![".som".to_string(), ".js".to_string(), ".json".to_string()],
            module_directories: Vec::new(),
            allow_js: true,
            resolve_json_module: true,
        }
    }
}

/// Loader and cache behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadingConfig {
    /// Source file encoding
    pub encoding: String,
    /// Keep compiled modules between loads
    pub cache: bool,
    /// Cycle policy
    pub circular_dependency_strategy: CircularDependencyStrategy,
    /// Maximum number of cached modules before eviction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cache_size: Option<u64>,
    /// Maximum bytes of cached source and code before eviction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cache_memory: Option<u64>,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            encoding: "utf-8".to_string(),
            cache: true,
            circular_dependency_strategy: CircularDependencyStrategy::default(),
            max_cache_size: None,
            max_cache_memory: None,
        }
    }
}

/// Options passed to the compiler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilationConfig {
    /// Output language version
    pub target: CompilationTarget,
    /// Produce source maps for bundles by default
    pub source_map: bool,
    /// Minify output
    pub minify: bool,
    /// Skip semantic checks
    pub no_type_check: bool,
    /// Emit strict-mode code
    pub strict: bool,
    /// Watch mode for the command line
    pub watch: bool,
    /// Recompile when a watched file is saved
    pub compile_on_save: bool,
    /// Output file for bundles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Output directory for per-module compilation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<PathBuf>,
    /// Per-module compile timeout in milliseconds
    pub timeout: u64,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            target: CompilationTarget::default(),
            source_map: false,
            minify: false,
            no_type_check: false,
            strict: false,
            watch: false,
            compile_on_save: false,
            output: None,
            out_dir: None,
            timeout: 30_000,
        }
    }
}

impl CompilationConfig {
    /// Compiler options for this configuration
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            target: self.target.into(),
            minify: self.minify,
            type_check: !self.no_type_check,
            strict: self.strict,
            timeout: Duration::from_millis(self.timeout),
            ..Default::default()
        }
    }
}

/// Resource ceilings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimitsConfig {
    /// Process memory ceiling in bytes
    pub max_memory_bytes: u64,
    /// Concurrently open source files
    pub max_file_handles: u64,
    /// Cached modules
    pub max_cached_modules: u64,
    /// Memory sampling interval in milliseconds
    pub check_interval: u64,
    /// Usage percentages at which memory warnings fire
    pub memory_warning_thresholds: Vec<f64>,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 1024 * 1024 * 1024,
            max_file_handles: 256,
            max_cached_modules: 10_000,
            check_interval: 5_000,
            memory_warning_thresholds: vec![80.0, 95.0],
        }
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a breaker
    pub failure_threshold: u64,
    /// Milliseconds an open breaker waits before allowing a trial call
    pub recovery_timeout: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: 30_000,
        }
    }
}

/// Complete module system configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleSystemConfig {
    /// Specifier resolution
    pub resolution: ResolutionConfig,
    /// Loading and caching
    pub loading: LoadingConfig,
    /// Compiler options
    pub compilation: CompilationConfig,
    /// Collect metrics
    pub metrics: bool,
    /// Wrap loads in circuit breakers
    pub circuit_breakers: bool,
    /// Serve the management endpoint
    pub management_server: bool,
    /// Port of the management endpoint
    pub management_port: u64,
    /// Timeout for façade operations in milliseconds
    pub operation_timeout: u64,
    /// Resource ceilings; unlimited when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimitsConfig>,
    /// Circuit breaker tuning
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ModuleSystemConfig {
    fn default() -> Self {
        Self {
            resolution: ResolutionConfig::default(),
            loading: LoadingConfig::default(),
            compilation: CompilationConfig::default(),
            metrics: false,
            circuit_breakers: false,
            management_server: false,
            management_port: 9464,
            operation_timeout: 30_000,
            resource_limits: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ModuleSystemConfig {
    /// Validate and load a configuration from JSON
    pub fn from_json_value(value: Value) -> Result<Self> {
        let violations = validate_value(&value);
        if !violations.is_empty() {
            return Err(ModuleError::Configuration(violations));
        }
        serde_json::from_value(value).map_err(|e| ModuleError::Configuration(vec![e.to_string()]))
    }

    /// Validate and load a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        Self::from_json_value(value)
    }

    /// Check every field, reporting all violations at once
    pub fn validate(&self) -> Result<()> {
        let value = serde_json::to_value(self)?;
        let violations = validate_value(&value);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ModuleError::Configuration(violations))
        }
    }

    /// Façade operation timeout
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout)
    }
}

/// Collects every violation in a JSON configuration document.
pub fn validate_value(value: &Value) -> Vec<String> {
    let mut v = Validator::default();
    let Some(root) = v.object(Some(value), "configuration") else {
        return v.violations;
    };

    if let Some(resolution) = v.object(root.get("resolution"), "resolution") {
        v.optional_string(resolution.get("baseUrl"), "resolution.baseUrl");
        if let Some(paths) = v.object(resolution.get("paths"), "resolution.paths") {
            for (alias, targets) in paths {
                v.string_array(Some(targets), &format!("resolution.paths[\"{}\"]", alias));
            }
        }
        if let Some(extensions) = v.string_array(resolution.get("extensions"), "resolution.extensions") {
            for (i, ext) in extensions.iter().enumerate() {
                if !ext.starts_with('.') || ext.len() < 2 {
                    v.push(format!(
                        "resolution.extensions[{}] must start with \".\" (got \"{}\")",
                        i, ext
                    ));
                }
            }
        }
        v.string_array(resolution.get("moduleDirectories"), "resolution.moduleDirectories");
        v.boolean(resolution.get("allowJs"), "resolution.allowJs");
        v.boolean(resolution.get("resolveJsonModule"), "resolution.resolveJsonModule");
    }

    if let Some(loading) = v.object(root.get("loading"), "loading") {
        if let Some(encoding) = v.string(loading.get("encoding"), "loading.encoding") {
            if !matches!(encoding.to_ascii_lowercase().as_str(), "utf-8" | "utf8") {
                v.push(format!("loading.encoding must be \"utf-8\" (got \"{}\")", encoding));
            }
        }
        v.boolean(loading.get("cache"), "loading.cache");
        v.one_of(
            loading.get("circularDependencyStrategy"),
            "loading.circularDependencyStrategy",
            &["error", "warn", "ignore"],
        );
        v.integer(loading.get("maxCacheSize"), "loading.maxCacheSize", 1, u64::MAX);
        v.integer(loading.get("maxCacheMemory"), "loading.maxCacheMemory", 1, u64::MAX);
    }

    if let Some(compilation) = v.object(root.get("compilation"), "compilation") {
        v.one_of(
            compilation.get("target"),
            "compilation.target",
            &["es5", "es2015", "es2020", "esnext"],
        );
        for flag in [
            "sourceMap",
            "minify",
            "noTypeCheck",
            "strict",
            "watch",
            "compileOnSave",
        ] {
            v.boolean(compilation.get(flag), &format!("compilation.{}", flag));
        }
        v.optional_string(compilation.get("output"), "compilation.output");
        v.optional_string(compilation.get("outDir"), "compilation.outDir");
        v.integer(compilation.get("timeout"), "compilation.timeout", 1, 600_000);
    }

    let metrics = v.boolean(root.get("metrics"), "metrics").unwrap_or(false);
    let circuit_breakers = v
        .boolean(root.get("circuitBreakers"), "circuitBreakers")
        .unwrap_or(false);
    let management_server = v
        .boolean(root.get("managementServer"), "managementServer")
        .unwrap_or(false);
    if management_server && !metrics {
        v.push("managementServer requires metrics to be enabled".to_string());
    }
    if management_server && !circuit_breakers {
        v.push("managementServer requires circuitBreakers to be enabled".to_string());
    }
    v.integer(root.get("managementPort"), "managementPort", 1, 65_535);
    v.integer(root.get("operationTimeout"), "operationTimeout", 1_000, 600_000);

    if let Some(limits) = v.object(root.get("resourceLimits"), "resourceLimits") {
        v.integer(
            limits.get("maxMemoryBytes"),
            "resourceLimits.maxMemoryBytes",
            1024 * 1024,
            u64::MAX,
        );
        v.integer(limits.get("maxFileHandles"), "resourceLimits.maxFileHandles", 1, u64::MAX);
        v.integer(
            limits.get("maxCachedModules"),
            "resourceLimits.maxCachedModules",
            1,
            u64::MAX,
        );
        v.integer(limits.get("checkInterval"), "resourceLimits.checkInterval", 100, 60_000);
        if let Some(thresholds) = limits.get("memoryWarningThresholds").filter(|t| !t.is_null()) {
            match thresholds.as_array() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        match item.as_f64() {
                            Some(pct) if pct > 0.0 && pct <= 100.0 => {}
                            _ => v.push(format!(
                                "resourceLimits.memoryWarningThresholds[{}] must be a percentage in (0, 100] (got {})",
                                i, item
                            )),
                        }
                    }
                }
                None => v.push(format!(
                    "resourceLimits.memoryWarningThresholds must be an array (got {})",
                    type_name(thresholds)
                )),
            }
        }
    }

    if let Some(breaker) = v.object(root.get("circuitBreaker"), "circuitBreaker") {
        v.integer(
            breaker.get("failureThreshold"),
            "circuitBreaker.failureThreshold",
            1,
            u64::MAX,
        );
        v.integer(
            breaker.get("recoveryTimeout"),
            "circuitBreaker.recoveryTimeout",
            1,
            u64::MAX,
        );
    }

    v.violations
}

/// Accumulates violations; every check tolerates an absent or `null` field.
#[derive(Default)]
struct Validator {
    violations: Vec<String>,
}

impl Validator {
    fn push(&mut self, message: String) {
        self.violations.push(message);
    }

    fn object<'v>(&mut self, value: Option<&'v Value>, path: &str) -> Option<&'v Map<String, Value>> {
        match value? {
            Value::Null => None,
            Value::Object(map) => Some(map),
            other => {
                self.push(format!("{} must be an object (got {})", path, type_name(other)));
                None
            }
        }
    }

    fn boolean(&mut self, value: Option<&Value>, path: &str) -> Option<bool> {
        match value? {
            Value::Null => None,
            Value::Bool(b) => Some(*b),
            other => {
                self.push(format!("{} must be a boolean (got {})", path, type_name(other)));
                None
            }
        }
    }

    fn string<'v>(&mut self, value: Option<&'v Value>, path: &str) -> Option<&'v str> {
        match value? {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => {
                self.push(format!("{} must be a string (got {})", path, type_name(other)));
                None
            }
        }
    }

    fn optional_string(&mut self, value: Option<&Value>, path: &str) {
        self.string(value, path);
    }

    fn string_array<'v>(&mut self, value: Option<&'v Value>, path: &str) -> Option<Vec<&'v str>> {
        let items = match value? {
            Value::Null => return None,
            Value::Array(items) => items,
            other => {
                self.push(format!("{} must be an array of strings (got {})", path, type_name(other)));
                return None;
            }
        };
        let mut strings = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match item.as_str() {
                Some(s) => strings.push(s),
                None => self.push(format!(
                    "{}[{}] must be a string (got {})",
                    path,
                    i,
                    type_name(item)
                )),
            }
        }
        Some(strings)
    }

    fn integer(&mut self, value: Option<&Value>, path: &str, min: u64, max: u64) -> Option<u64> {
        let value = value?;
        if value.is_null() {
            return None;
        }
        let in_range = value.as_u64().filter(|n| (min..=max).contains(n));
        if in_range.is_none() {
            let range = if max == u64::MAX {
                format!("an integer >= {}", min)
            } else {
                format!("an integer between {} and {}", min, max)
            };
            self.push(format!("{} must be {} (got {})", path, range, value));
        }
        in_range
    }

    fn one_of(&mut self, value: Option<&Value>, path: &str, allowed: &[&str]) {
        if let Some(s) = self.string(value, path) {
            if !allowed.contains(&s) {
                self.push(format!(
                    "{} must be one of {} (got \"{}\")",
                    path,
                    allowed.join(", "),
                    s
                ));
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ModuleSystemConfig::default().validate().is_ok());
        assert!(validate_value(&json!({})).is_empty());
    }

    #[test]
    fn test_management_server_requires_both() {
        let violations = validate_value(&json!({ "managementServer": true }));
        assert_eq!(violations.len(), 2);
        assert!(violations[0].contains("requires metrics"));
        assert!(violations[1].contains("requires circuitBreakers"));

        let violations = validate_value(&json!({
            "managementServer": true,
            "metrics": true,
            "circuitBreakers": true,
        }));
        assert!(violations.is_empty());
    }

    #[test]
    fn test_collects_every_violation() {
        let violations = validate_value(&json!({
            "resolution": { "extensions": ["som", ".js", 3] },
            "loading": { "circularDependencyStrategy": "panic", "cache": "yes" },
            "compilation": { "target": "es3" },
            "managementPort": 70000,
            "operationTimeout": 10,
            "resourceLimits": {
                "maxMemoryBytes": 1024,
                "maxFileHandles": 0,
                "checkInterval": 50,
                "memoryWarningThresholds": [80, 150]
            }
        }));
        let joined = violations.join("\n");
        for needle in [
            "resolution.extensions[0] must start with",
            "resolution.extensions[2] must be a string",
            "loading.circularDependencyStrategy must be one of",
            "loading.cache must be a boolean",
            "compilation.target must be one of",
            "managementPort must be an integer between 1 and 65535",
            "operationTimeout must be an integer between 1000 and 600000",
            "resourceLimits.maxMemoryBytes must be an integer >= 1048576",
            "resourceLimits.maxFileHandles must be an integer >= 1",
            "resourceLimits.checkInterval must be an integer between 100 and 60000",
            "resourceLimits.memoryWarningThresholds[1]",
        ] {
            assert!(joined.contains(needle), "missing '{}' in:\n{}", needle, joined);
        }
        assert_eq!(violations.len(), 11);
    }

    #[test]
    fn test_typed_config_uses_same_rules() {
        let config = ModuleSystemConfig {
            management_server: true,
            management_port: 0,
            ..Default::default()
        };
        let Err(ModuleError::Configuration(violations)) = config.validate() else {
            panic!("expected configuration error");
        };
        assert_eq!(violations.len(), 3);
    }

    #[test]
    fn test_from_json_value_round_trips_fields() {
        let config = ModuleSystemConfig::from_json_value(json!({
            "resolution": { "baseUrl": "src", "paths": { "@lib/*": ["lib/*"] } },
            "loading": { "circularDependencyStrategy": "error" },
            "compilation": { "target": "es5", "strict": true },
        }))
        .unwrap();
        assert_eq!(config.resolution.base_url, Some(PathBuf::from("src")));
        assert_eq!(
            config.loading.circular_dependency_strategy,
            CircularDependencyStrategy::Error
        );
        let options = config.compilation.compile_options();
        assert_eq!(options.target, Target::Es5);
        assert!(options.strict);
        assert_eq!(config.resolution.extensions, vec![".som", ".js", ".json"]);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("somon.json");
        std::fs::write(&path, r#"{ "metrics": true, "operationTimeout": 5000 }"#).unwrap();
        let config = ModuleSystemConfig::from_file(&path).unwrap();
        assert!(config.metrics);
        assert_eq!(config.operation_timeout(), Duration::from_secs(5));
    }
}
