//! Toolforge sandboxed module runtime.
//!
//! This crate loads, caches, executes, monitors and recovers the sandboxed
//! modules behind Toolforge's developer tools:
//!
//! - **[`module`]** -- The [`Module`] capability contract and the
//!   [`ModuleFactory`] seam.
//! - **[`builtin`]** -- Built-in JSON and code tools, dispatched over the
//!   closed [`BuiltinKind`] set.
//! - **[`sandbox`]** -- [`WasmSandbox`] runs WebAssembly guests under a fuel
//!   budget and a linear-memory ceiling.
//! - **[`loader`]** -- [`ModuleLoader`] gives exactly-once concurrent loading,
//!   dependency ordering, unload and preload.
//! - **[`registry`]** -- [`ModuleRegistry`] holds descriptors backed by
//!   [`dashmap::DashMap`], with search and hot updates.
//! - **[`recovery`]** -- Retries with backoff, per-module circuit breakers and
//!   fallback chains.
//! - **[`events`]** -- [`EventBus`] over [`tokio::sync::broadcast`].
//! - **[`runtime`]** -- [`ModuleRuntime`] ties it all together behind `run`.
//! - **[`error`]** / **[`classifier`]** -- [`ModuleError`] via [`thiserror`]
//!   and the normalizer every failure passes through.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod builtin;
pub mod classifier;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod factory;
pub mod instance;
pub mod loader;
pub mod module;
pub mod recovery;
pub mod registry;
pub mod result;
pub mod runtime;
pub mod sandbox;
pub mod source;
pub mod wasm_module;

// Re-export the most commonly used types at the crate root.
pub use builtin::{BuiltinKind, BuiltinModule};
pub use classifier::{ErrorClassifier, ErrorReport, Severity};
pub use config::{LogLevel, ModuleConfig, ResolvedConfig, RuntimeConfig};
pub use descriptor::{ModuleDescriptor, ModuleSource, ModuleUpdate};
pub use error::{ErrorCode, ModuleError, Result, SandboxError};
pub use events::{EventBus, RuntimeEvent};
pub use factory::{ToolFactory, ToolModule};
pub use instance::ModuleInstance;
pub use loader::ModuleLoader;
pub use module::{
    ExecuteOptions, HealthReport, HealthStatus, Module, ModuleFactory, ModuleMetadata,
    ModuleOutput,
};
pub use recovery::{CircuitState, RecoveryConfig, RecoveryPolicy};
pub use registry::{HttpUpdateSource, ModuleRegistry, StaticUpdateSource, UpdateSource};
pub use result::{ExecutionMetrics, ExecutionResult, RecoveryReport};
pub use runtime::ModuleRuntime;
pub use sandbox::WasmSandbox;
pub use wasm_module::WasmModule;
