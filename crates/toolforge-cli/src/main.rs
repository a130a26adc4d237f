//! CLI entry point for Toolforge.
//!
//! This binary provides the `toolforge` command: it builds one module runtime
//! from `toolforge.toml`, then runs, lists, searches, inspects, health-checks
//! and updates modules through it.

mod cli;
mod config;

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolforge_runtime::builtin;
use toolforge_runtime::{
    ExecuteOptions, ExecutionResult, HealthStatus, HttpUpdateSource, ModuleDescriptor, ModuleRegistry,
    ModuleRuntime, ToolFactory,
};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(if cli.debug { "debug" } else { "info" });

    let config = AppConfig::load(&cli.config)?.with_env_overrides();
    let runtime = build_runtime(&config)?;

    let outcome = match cli.command {
        Commands::Run {
            module,
            operation,
            input,
            file,
            json,
            params,
        } => {
            let request = RunRequest {
                module,
                operation,
                input,
                file,
                json,
                params,
            };
            cmd_run(&runtime, request, cli.debug).await
        }
        Commands::List { category } => cmd_list(&runtime, category.as_deref()),
        Commands::Search { query } => cmd_search(&runtime, &query),
        Commands::Info { module } => cmd_info(&runtime, &module),
        Commands::Health { module } => cmd_health(&runtime, module).await,
        Commands::Updates { apply } => cmd_updates(&runtime, apply).await,
    };

    runtime.shutdown().await;
    outcome
}

/// Build the runtime: built-in modules, configured modules, optional update
/// catalog.
fn build_runtime(config: &AppConfig) -> Result<ModuleRuntime> {
    let mut registry = ModuleRegistry::new();
    if let Some(url) = config.update_url()? {
        info!(%url, "using update catalog");
        registry = registry.with_update_source(HttpUpdateSource::new(url));
    }
    for descriptor in builtin::descriptors() {
        registry.register_module(descriptor);
    }
    for descriptor in &config.modules {
        registry.register_module(descriptor.clone());
    }

    let factory = ToolFactory::with_default_sandbox().context("failed to create wasm sandbox")?;
    Ok(ModuleRuntime::new(registry, factory, config.runtime_config()))
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

struct RunRequest {
    module: String,
    operation: String,
    input: Option<String>,
    file: Option<PathBuf>,
    json: bool,
    params: Vec<String>,
}

async fn cmd_run(runtime: &ModuleRuntime, request: RunRequest, debug: bool) -> Result<ExitCode> {
    let text = match (request.input, request.file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read input from stdin")?;
            buf
        }
    };

    let input = if request.json {
        serde_json::from_str(&text).context("--json input is not valid JSON")?
    } else {
        Value::String(text)
    };

    let mut options = ExecuteOptions::new(request.operation);
    for raw in &request.params {
        let (key, value) = parse_param(raw)?;
        options.params.insert(key, value);
    }

    let result = runtime.run(&request.module, input, options).await;
    Ok(if print_result(&result, debug)? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Parse `key=value`.  The value is JSON when it parses as JSON, otherwise
/// plain text.
fn parse_param(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("parameter '{raw}' must look like key=value");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("parameter '{raw}' has an empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

/// Print data to stdout or the error to stderr.  Returns whether the call
/// succeeded.
fn print_result(result: &ExecutionResult, debug: bool) -> Result<bool> {
    if let Some(recovery) = result.recovery() {
        info!(
            attempts = recovery.attempts,
            fallback = recovery.fallback.as_deref().unwrap_or("-"),
            "recovered from failures"
        );
    }

    if let Some(data) = result.data() {
        match data {
            Value::String(text) => println!("{text}"),
            other => println!("{}", serde_json::to_string_pretty(other)?),
        }
        return Ok(true);
    }

    if let Some(error) = result.error() {
        eprintln!("error [{}]: {}", error.code, error.message);
        for suggestion in &error.suggestions {
            eprintln!("  - {suggestion}");
        }
        if debug && !error.details.is_null() {
            eprintln!("details: {}", serde_json::to_string_pretty(&error.details)?);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Subcommands: list, search, info
// ---------------------------------------------------------------------------

fn cmd_list(runtime: &ModuleRuntime, category: Option<&str>) -> Result<ExitCode> {
    let modules = match category {
        Some(category) => runtime.registry().modules_by_category(category),
        None => runtime.registry().list_modules(),
    };
    print_table(&modules);
    Ok(ExitCode::SUCCESS)
}

fn cmd_search(runtime: &ModuleRuntime, query: &str) -> Result<ExitCode> {
    let modules = runtime.registry().search_modules(query);
    if modules.is_empty() {
        println!("No modules match '{query}'.");
    } else {
        print_table(&modules);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_table(modules: &[ModuleDescriptor]) {
    println!("  {:<20} {:<10} {:<10} NAME", "ID", "VERSION", "CATEGORY");
    for m in modules {
        println!("  {:<20} {:<10} {:<10} {}", m.id, m.version, m.category, m.name);
    }
}

fn cmd_info(runtime: &ModuleRuntime, module: &str) -> Result<ExitCode> {
    let registry = runtime.registry();
    let Some(descriptor) = registry.get_module(module) else {
        bail!("module '{module}' is not registered");
    };
    println!("{}", serde_json::to_string_pretty(&descriptor)?);

    match registry.resolve_dependencies(module) {
        Ok(order) if order.is_empty() => {}
        Ok(order) => println!("load order: {} -> {module}", order.join(" -> ")),
        Err(e) => eprintln!("dependencies unresolved: {}", e.message),
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Subcommands: health, updates
// ---------------------------------------------------------------------------

async fn cmd_health(runtime: &ModuleRuntime, module: Option<String>) -> Result<ExitCode> {
    let ids = match module {
        Some(id) => vec![id],
        None => runtime
            .registry()
            .list_modules()
            .into_iter()
            .map(|d| d.id)
            .collect(),
    };

    let mut healthy = true;
    for id in ids {
        match runtime.health(&id).await {
            Ok(report) => {
                println!(
                    "  {:<20} {:<10} {}us",
                    id,
                    format!("{:?}", report.status).to_lowercase(),
                    report.response_time.as_micros()
                );
                healthy &= report.status == HealthStatus::Healthy;
            }
            Err(e) => {
                println!("  {:<20} {:<10} [{}] {}", id, "error", e.code, e.message);
                healthy = false;
            }
        }
    }
    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_updates(runtime: &ModuleRuntime, apply: bool) -> Result<ExitCode> {
    let updates = runtime
        .registry()
        .check_for_updates()
        .await
        .context("failed to check for updates")?;
    if updates.is_empty() {
        println!("All modules are up to date.");
        return Ok(ExitCode::SUCCESS);
    }

    for update in &updates {
        println!(
            "  {:<20} {} -> {}",
            update.id, update.current_version, update.latest_version
        );
    }
    if apply {
        for update in &updates {
            let descriptor = runtime
                .update_module(&update.id)
                .await
                .with_context(|| format!("failed to update '{}'", update.id))?;
            println!("Updated {} to {}.", descriptor.id, descriptor.version);
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// Logs go to stderr so tool output on stdout stays pipeable.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
