//! Modules backed by a `.wasm` artifact.
//!
//! The artifact is fetched, checksum-verified and compiled during
//! `initialize`; each `execute` instantiates it afresh in the sandbox so calls
//! share no guest state.

use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::builtin::Lifecycle;
use crate::classifier::ErrorClassifier;
use crate::config::{DEFAULT_MAX_FUEL, ResolvedConfig};
use crate::descriptor::{ModuleDescriptor, ModuleSource};
use crate::error::{ModuleError, Result};
use crate::module::{ExecuteOptions, HealthReport, HealthStatus, Module, ModuleMetadata, ModuleOutput};
use crate::sandbox::{GuestLimits, WasmSandbox};
use crate::source::{fetch_artifact, verify_checksum};

/// A guest module following the sandbox `execute` ABI.
pub struct WasmModule {
    descriptor: ModuleDescriptor,
    location: String,
    sandbox: WasmSandbox,
    compiled: OnceLock<wasmtime::Module>,
    lifecycle: Lifecycle,
}

impl WasmModule {
    /// Bind a descriptor to the sandbox.  Fails unless the descriptor has a
    /// wasm source.
    pub fn new(descriptor: ModuleDescriptor, sandbox: WasmSandbox) -> Result<Self> {
        let location = match &descriptor.source {
            ModuleSource::Wasm { location } => location.clone(),
            ModuleSource::Builtin { .. } => {
                return Err(ModuleError::load_failed(
                    &descriptor.id,
                    "descriptor does not reference a wasm artifact",
                ));
            }
        };
        Ok(Self {
            descriptor,
            location,
            sandbox,
            compiled: OnceLock::new(),
            lifecycle: Lifecycle::default(),
        })
    }

    fn limits(config: &ResolvedConfig) -> GuestLimits {
        GuestLimits {
            max_memory: usize::try_from(config.max_memory).unwrap_or(usize::MAX),
            max_fuel: config.option_u64("max_fuel").unwrap_or(DEFAULT_MAX_FUEL),
        }
    }
}

#[async_trait]
impl Module for WasmModule {
    async fn initialize(&self, config: &ResolvedConfig) -> Result<()> {
        let bytes = fetch_artifact(&self.location).await?;
        verify_checksum(&bytes, self.descriptor.checksum.as_deref())?;

        let sandbox = self.sandbox.clone();
        let module = tokio::task::spawn_blocking(move || sandbox.compile(&bytes))
            .await
            .map_err(|e| ErrorClassifier::new().handle_error(e))??;

        if self.compiled.set(module).is_err() {
            tracing::debug!(module_id = %self.descriptor.id, "wasm module already compiled");
        }
        self.lifecycle.initialize(config);
        tracing::info!(
            module_id = %self.descriptor.id,
            location = %self.location,
            "wasm module compiled"
        );
        Ok(())
    }

    async fn execute(&self, input: Value, options: &ExecuteOptions) -> Result<ModuleOutput> {
        let config = self.lifecycle.config(&self.descriptor.id)?;
        let module = self.compiled.get().cloned().ok_or_else(|| {
            ModuleError::execution(format!("module '{}' is not compiled", self.descriptor.id))
        })?;
        let limits = Self::limits(config);
        let payload = serde_json::to_vec(&input)
            .map_err(|e| ModuleError::invalid_input(format!("input is not serializable: {e}")))?;

        let sandbox = self.sandbox.clone();
        let operation = options.operation.clone();
        let (out, cpu_time) = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let out = sandbox.invoke(&module, &operation, &payload, &limits);
            (out, started.elapsed())
        })
        .await
        .map_err(|e| ErrorClassifier::new().handle_error(e))?;
        let out = out?;

        for line in &out.logs {
            tracing::debug!(module_id = %self.descriptor.id, guest_log = %line);
        }

        // Guests may answer with JSON or plain text.
        let data = serde_json::from_slice(&out.output)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&out.output).into_owned()));
        Ok(ModuleOutput::new(data)
            .with_memory_peak(out.memory_peak as u64)
            .with_cpu_time(cpu_time))
    }

    async fn dispose(&self) {
        self.lifecycle.dispose();
        tracing::debug!(module_id = %self.descriptor.id, "wasm module disposed");
    }

    fn metadata(&self) -> ModuleMetadata {
        // The guest interprets operation names itself.
        ModuleMetadata::from_descriptor(&self.descriptor, &[])
    }

    async fn health(&self) -> HealthReport {
        let started = Instant::now();
        let status = match (self.lifecycle.status(), self.compiled.get()) {
            (HealthStatus::Healthy, Some(_)) => HealthStatus::Healthy,
            _ => HealthStatus::Unhealthy,
        };
        HealthReport::new(status, started.elapsed())
    }

    fn is_compatible(&self) -> bool {
        // Checked when the artifact compiles.
        true
    }
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule")
            .field("id", &self.descriptor.id)
            .field("location", &self.location)
            .field("compiled", &self.compiled.get().is_some())
            .finish()
    }
}
