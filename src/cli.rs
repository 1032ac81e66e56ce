// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Command-line definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "somon",
    about = "Compiler and bundler for the Somon language",
    version,
    author = "Pegasus Heavy Industries"
)]
pub struct Cli {
    /// Configuration file (defaults to ./somon.json when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a module and its dependencies
    Compile(CompileArgs),
    /// Bundle an entry point into a single CommonJS file
    Bundle(BundleArgs),
    /// Check a module graph for errors, cycles and missing files
    Check(CheckArgs),
    /// Recompile whenever an entry point or its dependencies change
    Watch(WatchArgs),
    /// Print the health of a freshly configured module system
    Health,
}

#[derive(Args)]
pub struct CompileArgs {
    /// Entry module
    pub file: PathBuf,

    /// Write each compiled module under this directory instead of printing the entry
    #[arg(short, long)]
    pub out_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct BundleArgs {
    /// Entry module
    pub entry: PathBuf,

    /// Output file (stdout when omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Minify the bundle
    #[arg(long)]
    pub minify: bool,

    /// Write a source map next to the output
    #[arg(long)]
    pub source_map: bool,

    /// Embed original sources in the source map
    #[arg(long, requires = "source_map")]
    pub inline_sources: bool,

    /// Leave this bare specifier to the host `require`
    #[arg(long = "external", value_name = "NAME")]
    pub externals: Vec<String>,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Entry module
    pub file: PathBuf,
}

#[derive(Args)]
pub struct WatchArgs {
    /// Entry module
    pub entry: PathBuf,
}
