// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # Somon Modules
//!
//! The module system behind the Somon toolchain: specifier resolution,
//! cached and deduplicated loading, dependency graphs with cycle detection,
//! CommonJS bundling, file watching and resource governance.
//!
//! ## Example
//!
//! ```rust,no_run
//! use somon_modules::{BundleRequest, ModuleSystem, ModuleSystemConfig};
//!
//! # async fn run() -> somon_modules::Result<()> {
//! let system = ModuleSystem::new(ModuleSystemConfig::default())?;
//! let bundle = system.bundle(&BundleRequest::new("src/main.som")).await?;
//! println!("{}", bundle.code);
//! system.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bundler;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod module_system;
pub mod resource_limiter;
pub mod server;
pub mod system;
pub mod timeout;
pub mod watcher;

pub use bundler::{Bundle, BundleRequest, Bundler};
pub use circuit_breaker::{BreakerSettings, CircuitBreakerManager, CircuitState};
pub use config::{CircularDependencyStrategy, ModuleSystemConfig};
pub use error::{ModuleError, Result};
pub use health::{CheckStatus, HealthReport, HealthStatus};
pub use metrics::MetricsCollector;
pub use module_system::{
    LoadedModule, Loaded, ModuleGraph, ModuleLoader, ModuleRegistry, ResolvedModule, Resolver,
};
pub use resource_limiter::{FileHandle, ModuleReservation, ResourceLimiter, ResourceLimits};
pub use system::{CompileResult, ModuleSystem, Statistics, ValidationResult};
pub use timeout::{run_with_timeouts, with_timeout, TimeoutPolicy};
pub use watcher::{ChangeCallback, ChangeEvent, ChangeKind, WatchSession};
