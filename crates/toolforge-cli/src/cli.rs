//! CLI argument definitions for Toolforge.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Toolforge -- sandboxed developer tools.
#[derive(Parser)]
#[command(
    name = "toolforge",
    version,
    about = "Toolforge -- sandboxed developer tools",
    long_about = "Runs JSON, code and WebAssembly tools as sandboxed modules with \
                  resource limits, retries and circuit breakers."
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = "toolforge.toml")]
    pub config: PathBuf,

    /// Verbose logging and full error details.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one operation on a module.
    Run {
        /// Module id or `file://` / `https://` location of a `.wasm` artifact.
        module: String,

        /// Operation to perform (e.g. `format`, `validate`, `to_yaml`).
        operation: String,

        /// Input text.  Read from `--file` or stdin when omitted.
        #[arg(long, short, conflicts_with = "file")]
        input: Option<String>,

        /// Read the input from a file.
        #[arg(long, short)]
        file: Option<PathBuf>,

        /// Parse the input as JSON instead of passing it as text.
        #[arg(long)]
        json: bool,

        /// Operation parameter as `key=value`; values are parsed as JSON
        /// when possible.  Repeatable.
        #[arg(long = "param", short = 'p', value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// List registered modules.
    List {
        /// Only show modules in this category.
        #[arg(long)]
        category: Option<String>,
    },

    /// Search modules by id, name, category, tag or description.
    Search {
        query: String,
    },

    /// Show a module's descriptor and dependency order.
    Info {
        module: String,
    },

    /// Load modules and report their health.
    Health {
        /// Check a single module instead of every registered one.
        module: Option<String>,
    },

    /// Check the update catalog for newer module versions.
    Updates {
        /// Apply every available update.
        #[arg(long)]
        apply: bool,
    },
}
