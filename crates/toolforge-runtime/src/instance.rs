//! Loaded module instances.
//!
//! A [`ModuleInstance`] is what the loader caches: the materialized module,
//! the configuration it was initialized with, and its usage counters.  All
//! resource ceilings are enforced here, around the module's own `execute`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::classifier::ErrorClassifier;
use crate::config::ResolvedConfig;
use crate::descriptor::ModuleDescriptor;
use crate::error::{ErrorCode, ModuleError, Result};
use crate::module::{ExecuteOptions, HealthReport, Module, ModuleMetadata};
use crate::result::{ExecutionMetrics, ExecutionResult};

/// Wall time, as a fraction of the timeout, above which a call is flagged
/// as slow.
const SLOW_CALL_RATIO: f64 = 0.8;

/// A module owned by the loader.
pub struct ModuleInstance<M> {
    descriptor: ModuleDescriptor,
    module: M,
    config: ResolvedConfig,
    is_initialized: AtomicBool,
    execution_count: AtomicU64,
    memory_usage: AtomicU64,
    load_time: Duration,
    loaded_at: DateTime<Utc>,
}

impl<M: Module> ModuleInstance<M> {
    /// Wrap an already initialized module.
    pub(crate) fn new(
        descriptor: ModuleDescriptor,
        module: M,
        config: ResolvedConfig,
        load_time: Duration,
    ) -> Self {
        Self {
            descriptor,
            module,
            config,
            is_initialized: AtomicBool::new(true),
            execution_count: AtomicU64::new(0),
            memory_usage: AtomicU64::new(0),
            load_time,
            loaded_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::SeqCst)
    }

    /// Number of executions that completed within the timeout.
    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Relaxed)
    }

    /// Peak memory of the last completed execution, in bytes.
    pub fn memory_usage(&self) -> u64 {
        self.memory_usage.load(Ordering::Relaxed)
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn metadata(&self) -> ModuleMetadata {
        self.module.metadata()
    }

    pub async fn health(&self) -> HealthReport {
        self.module.health().await
    }

    /// Execute under the instance's ceilings.  Never fails; errors are
    /// carried in the result.
    pub async fn execute(&self, input: Value, options: &ExecuteOptions) -> ExecutionResult {
        match self.try_execute(input, options).await {
            Ok(result) => result,
            Err(err) => ExecutionResult::failure(err, None),
        }
    }

    /// Execute under the instance's ceilings, returning failures as `Err`.
    ///
    /// The `Ok` result is always successful.
    pub async fn try_execute(&self, input: Value, options: &ExecuteOptions) -> Result<ExecutionResult> {
        if !self.is_initialized() {
            return Err(ModuleError::new(
                ErrorCode::InitializationError,
                format!("module '{}' has been unloaded", self.id()),
            )
            .with_detail("module_id", self.id()));
        }

        let limit = self.config.max_memory;
        let input_size = json_size(&input);
        if input_size > limit {
            return Err(self.memory_violation("input", input_size));
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout, self.module.execute(input, options)).await;
        let wall_time = started.elapsed();

        let output = match outcome {
            Err(_elapsed) => {
                let timeout_ms = self.config.timeout.as_millis() as u64;
                tracing::warn!(module_id = %self.id(), timeout_ms, "execution timed out");
                return Err(ModuleError::new(
                    ErrorCode::TimeoutError,
                    format!("module '{}' exceeded its {timeout_ms}ms timeout", self.id()),
                )
                .with_detail("module_id", self.id())
                .with_detail("timeout_ms", timeout_ms));
            }
            Ok(Err(err)) => {
                return Err(ErrorClassifier::new().handle_error(err.with_detail("module_id", self.id())));
            }
            Ok(Ok(output)) => output,
        };

        let output_size = json_size(&output.data);
        if output_size > limit {
            return Err(self.memory_violation("output", output_size));
        }
        let memory_peak = output
            .memory_peak
            .unwrap_or(0)
            .max(input_size.saturating_add(output_size));
        if memory_peak > limit {
            return Err(self.memory_violation("peak", memory_peak));
        }

        if wall_time.as_secs_f64() > self.config.timeout.as_secs_f64() * SLOW_CALL_RATIO {
            tracing::warn!(
                module_id = %self.id(),
                code = %ErrorCode::PerformanceWarning,
                wall_time_ms = wall_time.as_millis() as u64,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "execution close to timeout"
            );
        }

        self.execution_count.fetch_add(1, Ordering::Relaxed);
        self.memory_usage.store(memory_peak, Ordering::Relaxed);

        let metrics = ExecutionMetrics {
            cpu_time: output.cpu_time.unwrap_or(wall_time),
            wall_time,
            memory_peak,
        };
        tracing::debug!(
            module_id = %self.id(),
            operation = %options.operation,
            wall_time_ms = wall_time.as_millis() as u64,
            memory_peak,
            "execution finished"
        );
        Ok(ExecutionResult::ok(output.data, Some(metrics)))
    }

    /// Release the module.  Idempotent.
    pub(crate) async fn dispose(&self) {
        if self.is_initialized.swap(false, Ordering::SeqCst) {
            self.module.dispose().await;
        }
    }

    fn memory_violation(&self, what: &str, size: u64) -> ModuleError {
        let limit = self.config.max_memory;
        tracing::warn!(module_id = %self.id(), what, size, limit, "memory ceiling exceeded");
        ModuleError::new(
            ErrorCode::MemoryLimitExceeded,
            format!(
                "module '{}' {what} needs {size} bytes, limit is {limit}",
                self.id()
            ),
        )
        .with_detail("module_id", self.id())
        .with_detail("size", size)
        .with_detail("limit", limit)
    }
}

impl<M> std::fmt::Debug for ModuleInstance<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("id", &self.descriptor.id)
            .field("version", &self.descriptor.version)
            .field("execution_count", &self.execution_count.load(Ordering::Relaxed))
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Serialized size of a JSON value, in bytes.
fn json_size(value: &Value) -> u64 {
    match value {
        Value::String(s) => s.len() as u64,
        other => serde_json::to_vec(other).map(|v| v.len() as u64).unwrap_or(0),
    }
}
