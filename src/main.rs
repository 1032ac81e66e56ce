// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! somon - compiler and bundler for the Somon language
//!
//! ## Commands
//!
//! - `compile` prints or writes the generated JavaScript of a module graph
//! - `bundle` produces one CommonJS file, optionally with a source map
//! - `check` reports warnings, cycles and missing dependencies
//! - `watch` recompiles on change
//! - `health` prints subsystem health

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{BundleArgs, CheckArgs, Cli, Commands, CompileArgs, WatchArgs};
use owo_colors::OwoColorize;
use somon_modules::bundler::bundle_id;
use somon_modules::{BundleRequest, ChangeCallback, ModuleSystem, ModuleSystemConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_CONFIG: &str = "somon.json";

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins when set
    let default_filter = if cli.verbose { "somon=debug" } else { "somon=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_deref())?;
    let system = ModuleSystem::new(config)?;

    let result = match &cli.command {
        Commands::Compile(args) => compile(&system, args).await,
        Commands::Bundle(args) => bundle(&system, args).await,
        Commands::Check(args) => check(&system, args).await,
        Commands::Watch(args) => watch(&system, args).await,
        Commands::Health => health(&system),
    };
    system.shutdown();

    match result {
        Ok(code) => Ok(code),
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ModuleSystemConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if !default.is_file() {
                return Ok(ModuleSystemConfig::default());
            }
            default
        }
    };
    debug!(path = %path.display(), "Loading configuration");
    ModuleSystemConfig::from_file(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("{}: {}", "warning".yellow().bold(), warning);
    }
}

async fn compile(system: &ModuleSystem, args: &CompileArgs) -> anyhow::Result<ExitCode> {
    let result = system.compile(&args.file).await?;
    print_warnings(&result.warnings);

    let out_dir = args
        .out_dir
        .clone()
        .or_else(|| system.config().compilation.out_dir.clone());
    let Some(out_dir) = out_dir else {
        if let Some(entry) = result.modules.last() {
            println!("{}", entry.code);
        }
        return Ok(ExitCode::SUCCESS);
    };

    let root = result
        .entry_point
        .parent()
        .context("entry point has no parent directory")?;
    for module in &result.modules {
        let id = bundle_id(root, &module.id)?;
        let Some(relative) = id.strip_prefix("./") else {
            eprintln!(
                "{}: {} is outside the entry directory; skipped",
                "warning".yellow().bold(),
                module.id.display()
            );
            continue;
        };
        let target = out_dir.join(relative).with_extension("js");
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &module.code)
            .await
            .with_context(|| format!("cannot write {}", target.display()))?;
        println!("{} {}", "wrote".green(), target.display());
    }
    Ok(ExitCode::SUCCESS)
}

async fn bundle(system: &ModuleSystem, args: &BundleArgs) -> anyhow::Result<ExitCode> {
    let compilation = &system.config().compilation;
    let mut request = BundleRequest::new(&args.entry);
    request.minify = args.minify || compilation.minify;
    request.source_maps = args.source_map || compilation.source_map;
    request.inline_sources = args.inline_sources;
    request.externals = args.externals.iter().cloned().collect();

    let bundle = system.bundle(&request).await?;
    let output = args.output.clone().or_else(|| compilation.output.clone());
    let Some(output) = output else {
        print!("{}", bundle.code);
        return Ok(ExitCode::SUCCESS);
    };

    let mut code = bundle.code;
    if let Some(map) = &bundle.map {
        let map_path = PathBuf::from(format!("{}.map", output.display()));
        let map_name = map_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tokio::fs::write(&map_path, map)
            .await
            .with_context(|| format!("cannot write {}", map_path.display()))?;
        code.push_str(&format!("//# sourceMappingURL={}\n", map_name));
        println!("{} {}", "wrote".green(), map_path.display());
    }
    tokio::fs::write(&output, code)
        .await
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("{} {}", "wrote".green(), output.display());
    Ok(ExitCode::SUCCESS)
}

async fn check(system: &ModuleSystem, args: &CheckArgs) -> anyhow::Result<ExitCode> {
    let result = system.compile(&args.file).await?;
    print_warnings(&result.warnings);

    let validation = system.validate();
    for error in result.errors.iter().chain(&validation.errors) {
        eprintln!("{}: {}", "error".red().bold(), error);
    }
    if validation.is_valid && result.errors.is_empty() {
        println!(
            "{} {} modules, {} external dependencies",
            "ok".green().bold(),
            result.modules.len(),
            result.dependencies.len()
        );
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn watch(system: &ModuleSystem, args: &WatchArgs) -> anyhow::Result<ExitCode> {
    if system.config().management_server {
        let addr = system.start_management_server().await?;
        println!("{} http://{}", "management".cyan(), addr);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_change: ChangeCallback = Arc::new(move |event| {
        let _ = tx.send(event);
    });

    rebuild(system, &args.entry).await;
    system.watch(&args.entry, on_change.clone()).await?;
    println!("{} {}", "watching".cyan().bold(), args.entry.display());

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                println!("{} {}", "changed".cyan(), event.file_path.display());
                system.invalidate(&event.file_path);
                rebuild(system, &args.entry).await;

                // The dependency set may have changed
                system.stop_watching();
                system.watch(&args.entry, on_change.clone()).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }
    system.stop_watching();
    Ok(ExitCode::SUCCESS)
}

async fn rebuild(system: &ModuleSystem, entry: &Path) {
    match system.compile(entry).await {
        Ok(result) => {
            print_warnings(&result.warnings);
            println!(
                "{} {} modules",
                "compiled".green().bold(),
                result.modules.len()
            );
        }
        Err(e) => eprintln!("{}: {}", "error".red().bold(), e),
    }
}

fn health(system: &ModuleSystem) -> anyhow::Result<ExitCode> {
    let report = system.get_health();
    let document = serde_json::json!({
        "health": report,
        "statistics": system.get_statistics(),
    });
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(ExitCode::SUCCESS)
}
