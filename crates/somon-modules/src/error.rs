// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the module system

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for module system operations
pub type Result<T> = std::result::Result<T, ModuleError>;

/// Errors that can occur while resolving, loading or bundling modules
///
/// Every variant carries only owned messages so that one failed in-flight
/// load can be handed to every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModuleError {
    /// Specifier could not be mapped to a file
    #[error("Cannot resolve module '{specifier}' from '{}'", .from.display())]
    Resolution {
        /// Specifier as written
        specifier: String,
        /// Directory the specifier was resolved against
        from: PathBuf,
    },

    /// Reading or compiling a module failed
    #[error("Failed to load module '{}': {reason}", .path.display())]
    Load {
        /// Offending file
        path: PathBuf,
        /// Reason for failure
        reason: String,
    },

    /// Import graph contains a cycle and the policy is `error`
    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency {
        /// Modules on the cycle, first module repeated at the end
        cycle: Vec<String>,
    },

    /// One or more configuration fields are invalid
    #[error("Invalid module system configuration:\n{}", format_violations(.0))]
    Configuration(Vec<String>),

    /// A resource ceiling would be exceeded
    #[error("Resource limit exceeded: {resource} (limit {limit})")]
    ResourceLimitExceeded {
        /// Name of the limit
        resource: String,
        /// Configured ceiling
        limit: u64,
    },

    /// Fail-fast rejection from an open circuit breaker
    #[error("Circuit breaker open for '{key}'; retry in {retry_in_ms} ms")]
    CircuitBreakerOpen {
        /// Breaker key
        key: String,
        /// Milliseconds until a trial call is allowed
        retry_in_ms: u64,
    },

    /// Bundling failed
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// Operation did not finish in time
    #[error("Operation '{operation}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Operation name
        operation: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Several operations of a batch timed out
    #[error("{} operations timed out: {}", .0.len(), .0.join(", "))]
    AggregateTimeout(Vec<String>),

    /// File watching error
    #[error("Watch error: {0}")]
    Watch(String),

    /// File system error
    #[error("File system error: {0}")]
    Io(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(String),

    /// Management server error
    #[error("Management server error: {0}")]
    Server(String),

    /// The module system was shut down
    #[error("Module system has been shut down")]
    ShutDown,
}

impl ModuleError {
    /// Create a resolution error
    pub fn resolution(specifier: impl Into<String>, from: &Path) -> Self {
        Self::Resolution {
            specifier: specifier.into(),
            from: from.to_path_buf(),
        }
    }

    /// Create a load error for a file
    pub fn load(path: &Path, reason: impl Into<String>) -> Self {
        Self::Load {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Create a bundle error
    pub fn bundle(message: impl Into<String>) -> Self {
        Self::Bundle(message.into())
    }

    /// Create a resource limit error
    pub fn resource_limit(resource: impl Into<String>, limit: u64) -> Self {
        Self::ResourceLimitExceeded {
            resource: resource.into(),
            limit,
        }
    }
}

impl From<std::io::Error> for ModuleError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl From<notify::Error> for ModuleError {
    fn from(e: notify::Error) -> Self {
        Self::Watch(e.to_string())
    }
}

fn format_violations(violations: &[String]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_lists_each_violation() {
        let err = ModuleError::Configuration(vec!["a is wrong".into(), "b is wrong".into()]);
        let message = err.to_string();
        assert_eq!(
            message,
            "Invalid module system configuration:\n  - a is wrong\n  - b is wrong"
        );
    }

    #[test]
    fn test_messages_name_the_offender() {
        let err = ModuleError::resolution("./missing", Path::new("/project/src"));
        assert_eq!(
            err.to_string(),
            "Cannot resolve module './missing' from '/project/src'"
        );

        let err = ModuleError::CircularDependency {
            cycle: vec!["a.som".into(), "b.som".into(), "a.som".into()],
        };
        assert!(err.to_string().contains("a.som -> b.som -> a.som"));
    }
}
