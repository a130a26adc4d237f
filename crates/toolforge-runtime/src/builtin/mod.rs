//! Built-in modules.
//!
//! The host ships a closed set of modules, one per [`BuiltinKind`].  Each kind
//! is a pure, stateless transform over its input; [`BuiltinModule`] wraps a
//! kind with the lifecycle bookkeeping the [`Module`] contract requires and
//! runs the transform on the blocking pool so a slow input can be raced
//! against the instance timeout.
//!
//! [`descriptors`] is the bootstrap list the composition root registers at
//! startup.

mod code_executor;
mod code_formatter;
mod json_converter;
mod json_formatter;
mod json_validator;

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ResolvedConfig;
use crate::descriptor::{ModuleDescriptor, ModuleSource};
use crate::error::{ErrorCode, ModuleError, Result};
use crate::module::{
    ExecuteOptions, HealthReport, HealthStatus, Module, ModuleMetadata, ModuleOutput,
};
use crate::sandbox::WasmSandbox;

/// Version reported by every built-in module.
pub const BUILTIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The closed set of modules compiled into the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinKind {
    JsonFormatter,
    JsonValidator,
    JsonConverter,
    CodeFormatter,
    CodeExecutor,
}

impl BuiltinKind {
    pub const ALL: [BuiltinKind; 5] = [
        Self::JsonFormatter,
        Self::JsonValidator,
        Self::JsonConverter,
        Self::CodeFormatter,
        Self::CodeExecutor,
    ];

    /// Registry id of this module.
    pub fn id(&self) -> &'static str {
        match self {
            Self::JsonFormatter => "json-formatter",
            Self::JsonValidator => "json-validator",
            Self::JsonConverter => "json-converter",
            Self::CodeFormatter => "code-formatter",
            Self::CodeExecutor => "code-executor",
        }
    }

    /// Operations accepted by `execute`.
    pub fn operations(&self) -> &'static [&'static str] {
        match self {
            Self::JsonFormatter => json_formatter::OPERATIONS,
            Self::JsonValidator => json_validator::OPERATIONS,
            Self::JsonConverter => json_converter::OPERATIONS,
            Self::CodeFormatter => code_formatter::OPERATIONS,
            Self::CodeExecutor => code_executor::OPERATIONS,
        }
    }

    /// The registry descriptor for this module.
    pub fn descriptor(&self) -> ModuleDescriptor {
        let (name, category, description, tags): (&str, &str, &str, &[&str]) = match self {
            Self::JsonFormatter => (
                "JSON Formatter",
                "json",
                "Pretty-print or minify JSON documents",
                &["pretty", "beautify", "minify"],
            ),
            Self::JsonValidator => (
                "JSON Validator",
                "json",
                "Check JSON syntax and report the first error position",
                &["lint", "syntax"],
            ),
            Self::JsonConverter => (
                "JSON Converter",
                "json",
                "Convert between JSON, YAML, XML and CSV",
                &["yaml", "xml", "csv", "convert"],
            ),
            Self::CodeFormatter => (
                "Code Formatter",
                "code",
                "Re-indent brace-delimited source code",
                &["indent", "beautify"],
            ),
            Self::CodeExecutor => (
                "Code Executor",
                "code",
                "Run WebAssembly programs in an isolated sandbox",
                &["wasm", "wat", "run"],
            ),
        };
        ModuleDescriptor::new(
            self.id(),
            name,
            BUILTIN_VERSION,
            category,
            ModuleSource::Builtin { kind: *self },
        )
        .with_description(description)
        .with_tags(tags.iter().copied())
    }

    /// Run the transform synchronously.
    fn run(
        &self,
        input: Value,
        options: &ExecuteOptions,
        config: &ResolvedConfig,
        sandbox: &WasmSandbox,
    ) -> Result<ModuleOutput> {
        match self {
            Self::JsonFormatter => json_formatter::run(input, options, config).map(Into::into),
            Self::JsonValidator => json_validator::run(input, options, config).map(Into::into),
            Self::JsonConverter => json_converter::run(input, options, config).map(Into::into),
            Self::CodeFormatter => code_formatter::run(input, options, config).map(Into::into),
            Self::CodeExecutor => code_executor::run(input, options, config, sandbox),
        }
    }
}

/// Descriptors of every built-in module.
pub fn descriptors() -> Vec<ModuleDescriptor> {
    BuiltinKind::ALL.iter().map(BuiltinKind::descriptor).collect()
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialization/disposal bookkeeping shared by in-host modules.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    config: OnceLock<ResolvedConfig>,
    disposed: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn initialize(&self, config: &ResolvedConfig) {
        if self.config.set(config.clone()).is_err() {
            tracing::debug!("module already initialized, keeping original config");
        }
        self.disposed.store(false, Ordering::SeqCst);
    }

    /// The active config, or an error if the module is not usable.
    pub(crate) fn config(&self, module_id: &str) -> Result<&ResolvedConfig> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ModuleError::new(
                ErrorCode::ExecutionError,
                format!("module '{module_id}' has been disposed"),
            )
            .with_detail("module_id", module_id));
        }
        self.config.get().ok_or_else(|| {
            ModuleError::new(
                ErrorCode::InitializationError,
                format!("module '{module_id}' is not initialized"),
            )
            .with_detail("module_id", module_id)
        })
    }

    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn status(&self) -> HealthStatus {
        if self.disposed.load(Ordering::SeqCst) || self.config.get().is_none() {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Reject operations a module does not support.
pub(crate) fn check_operation(module_id: &str, operation: &str, supported: &[&str]) -> Result<()> {
    if supported.contains(&operation) {
        return Ok(());
    }
    Err(ModuleError::invalid_input(format!(
        "module '{module_id}' does not support operation '{operation}'"
    ))
    .with_detail("operation", operation)
    .with_detail("supported", supported.to_vec())
    .with_suggestions([format!("Use one of: {}", supported.join(", "))]))
}

/// Accept either a JSON document as text or an already-parsed value.
pub(crate) fn json_input(input: Value) -> Result<Value> {
    match input {
        Value::String(text) => serde_json::from_str(&text).map_err(|e| {
            ModuleError::invalid_input(format!("input is not valid JSON: {e}"))
                .with_detail("line", e.line())
                .with_detail("column", e.column())
        }),
        other => Ok(other),
    }
}

/// Require a text input.
pub(crate) fn text_input(input: Value) -> Result<String> {
    match input {
        Value::String(text) => Ok(text),
        other => Err(ModuleError::invalid_input(format!(
            "expected text input, got {}",
            json_type_name(&other)
        ))),
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// BuiltinModule
// ---------------------------------------------------------------------------

/// A built-in kind bound to its descriptor and lifecycle state.
pub struct BuiltinModule {
    kind: BuiltinKind,
    descriptor: ModuleDescriptor,
    sandbox: WasmSandbox,
    lifecycle: Lifecycle,
}

impl BuiltinModule {
    pub fn new(kind: BuiltinKind, descriptor: ModuleDescriptor, sandbox: WasmSandbox) -> Self {
        Self {
            kind,
            descriptor,
            sandbox,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn kind(&self) -> BuiltinKind {
        self.kind
    }
}

#[async_trait]
impl Module for BuiltinModule {
    async fn initialize(&self, config: &ResolvedConfig) -> Result<()> {
        self.lifecycle.initialize(config);
        tracing::debug!(module_id = %self.descriptor.id, kind = ?self.kind, "builtin module initialized");
        Ok(())
    }

    async fn execute(&self, input: Value, options: &ExecuteOptions) -> Result<ModuleOutput> {
        let config = self.lifecycle.config(&self.descriptor.id)?.clone();
        check_operation(&self.descriptor.id, &options.operation, self.kind.operations())?;

        let kind = self.kind;
        let options = options.clone();
        let sandbox = self.sandbox.clone();
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            kind.run(input, &options, &config, &sandbox)
                .map(|out| match out.cpu_time {
                    Some(_) => out,
                    None => out.with_cpu_time(started.elapsed()),
                })
        })
        .await
        .map_err(|e| crate::classifier::ErrorClassifier::new().handle_error(e))?
    }

    async fn dispose(&self) {
        self.lifecycle.dispose();
        tracing::debug!(module_id = %self.descriptor.id, "builtin module disposed");
    }

    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata::from_descriptor(&self.descriptor, self.kind.operations())
    }

    async fn health(&self) -> HealthReport {
        let started = Instant::now();
        let status = self.lifecycle.status();
        HealthReport::new(status, started.elapsed().max(Duration::from_nanos(1)))
    }

    fn is_compatible(&self) -> bool {
        // Built-ins are compiled with the host.
        true
    }
}
