// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module resolution, loading and bookkeeping
//!
//! ## Resolution
//! - Relative (`./`, `../`) and absolute specifiers map to files
//! - Extensions and `index` files are tried in configured order
//! - Bare specifiers go through path aliases and module directories,
//!   otherwise they name an external library
//!
//! ## Loading
//! - One read and compile per canonical path, even under concurrent requests
//! - Dependency graphs in topological order with a configurable cycle policy

mod cache;
mod loader;
mod registry;
mod resolver;

pub use cache::{Dependency, LoadedModule, ModuleCache};
pub use loader::{Loaded, LoaderOptions, ModuleGraph, ModuleLoader};
pub use registry::{MissingDependency, ModuleRegistry, RegistryStatistics};
pub use resolver::{ResolvedModule, Resolver, SpecifierKind};

pub(crate) use resolver::normalize;
