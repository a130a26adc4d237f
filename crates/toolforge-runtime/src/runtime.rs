//! Runtime facade.
//!
//! [`ModuleRuntime`] composes the registry, loader and recovery policy into
//! the single entry point tool handlers use:
//!
//! ```rust,no_run
//! # use toolforge_runtime::{ExecuteOptions, ModuleRuntime, RuntimeConfig};
//! # async fn example() -> Result<(), toolforge_runtime::ModuleError> {
//! let runtime = ModuleRuntime::with_builtins(RuntimeConfig::default())?;
//! let result = runtime
//!     .run("json-formatter", "{\"a\":1}".into(), ExecuteOptions::new("format"))
//!     .await;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! `run` never fails and never panics on caller input: every failure comes
//! back inside the [`ExecutionResult`], has been through the classifier, and
//! is published as an [`ErrorReport`](crate::classifier::ErrorReport).

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;

use crate::builtin;
use crate::classifier::{ErrorClassifier, RawFailure, Severity};
use crate::config::RuntimeConfig;
use crate::descriptor::ModuleDescriptor;
use crate::error::{ErrorCode, ModuleError, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::factory::ToolFactory;
use crate::loader::ModuleLoader;
use crate::module::{ExecuteOptions, HealthReport, ModuleFactory};
use crate::recovery::{AttemptState, RecoveryPolicy};
use crate::registry::ModuleRegistry;
use crate::result::{ExecutionResult, RecoveryReport};

/// The module runtime.  Construct one at startup and share it.
pub struct ModuleRuntime<F: ModuleFactory = ToolFactory> {
    registry: ModuleRegistry,
    loader: ModuleLoader<F>,
    recovery: RecoveryPolicy,
    events: EventBus,
    classifier: ErrorClassifier,
    config: RuntimeConfig,
}

impl ModuleRuntime<ToolFactory> {
    /// A runtime with every built-in module registered and the default
    /// factory.
    pub fn with_builtins(config: RuntimeConfig) -> Result<Self> {
        let registry = ModuleRegistry::new();
        for descriptor in builtin::descriptors() {
            registry.register_module(descriptor);
        }
        Ok(Self::new(registry, ToolFactory::with_default_sandbox()?, config))
    }
}

impl<F: ModuleFactory> ModuleRuntime<F> {
    pub fn new(registry: ModuleRegistry, factory: F, config: RuntimeConfig) -> Self {
        let events = registry.attach_events(EventBus::new(config.event_capacity));
        let loader = ModuleLoader::new(
            registry.clone(),
            factory,
            config.defaults.clone(),
            events.clone(),
        );
        let recovery = RecoveryPolicy::new(config.recovery.clone(), events.clone());
        tracing::debug!(
            modules = registry.len(),
            max_attempts = config.recovery.max_attempts,
            "module runtime created"
        );
        Self {
            registry,
            loader,
            recovery,
            events,
            classifier: ErrorClassifier::new(),
            config,
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn loader(&self) -> &ModuleLoader<F> {
        &self.loader
    }

    pub fn recovery(&self) -> &RecoveryPolicy {
        &self.recovery
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Add `fallback` to the chain tried when `primary` keeps failing.
    pub fn register_fallback(&self, primary: &str, fallback: &str) {
        self.recovery.register_fallback(primary, fallback);
    }

    /// Run one operation on a module, loading it if needed.
    pub async fn run(&self, module_id: &str, input: Value, options: ExecuteOptions) -> ExecutionResult {
        let (outcome, mut report) = self.run_with_retries(module_id, &input, &options).await;
        let error = match outcome {
            Ok(result) if report.attempted => return result.with_recovery(report),
            Ok(result) => return result,
            Err(error) => error,
        };

        // Fallbacks only replace a primary that is unavailable or kept
        // failing transiently; other failures are the caller's to see.
        let eligible = error.code == ErrorCode::CircuitOpen || (report.attempted && error.recoverable);
        if eligible {
            for fallback in self.recovery.fallbacks(module_id) {
                tracing::info!(
                    module_id = %module_id,
                    %fallback,
                    state = ?AttemptState::FallbackInvoked,
                    "invoking fallback"
                );
                self.events.publish(RuntimeEvent::FallbackInvoked {
                    primary: module_id.to_owned(),
                    fallback: fallback.clone(),
                });

                let (outcome, fb_report) = self.run_with_retries(&fallback, &input, &options).await;
                report.attempted = true;
                report.attempts += fb_report.attempts;
                report.retried.extend(fb_report.retried);
                match outcome {
                    Ok(result) => {
                        report.success = true;
                        report.fallback = Some(fallback);
                        return result.with_recovery(report);
                    }
                    Err(fb_error) => {
                        tracing::warn!(
                            module_id = %module_id,
                            %fallback,
                            code = %fb_error.code,
                            "fallback failed"
                        );
                    }
                }
            }
        }

        self.report_failure(module_id, &error);
        let result = ExecutionResult::failure(error, None);
        if report.attempted {
            result.with_recovery(report)
        } else {
            result
        }
    }

    /// One module: circuit check, first call, then retries.
    async fn run_with_retries(
        &self,
        module_id: &str,
        input: &Value,
        options: &ExecuteOptions,
    ) -> (Result<ExecutionResult>, RecoveryReport) {
        let mut report = RecoveryReport::default();
        if let Err(open) = self.recovery.check_circuit(module_id) {
            return (Err(open), report);
        }

        let this = self;
        let call = move || {
            let input = input.clone();
            async move { this.execute_once(module_id, input, options).await }
        };

        report.attempts = 1;
        let error = match call().await {
            Ok(result) => {
                self.recovery.record_success(module_id);
                return (Ok(result), report);
            }
            Err(error) => error,
        };
        self.recovery.record_failure(module_id);

        let attempt = self.recovery.attempt_recovery(module_id, &error, call).await;
        report.attempted = attempt.attempted;
        report.success = attempt.success;
        report.attempts += attempt.attempts;
        report.retried = attempt.retried;
        (attempt.result, report)
    }

    /// Load (if needed) and execute once.  Panics become errors.
    async fn execute_once(
        &self,
        module_id: &str,
        input: Value,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult> {
        let call = async {
            let instance = self.loader.load_module(module_id, None).await?;
            instance.try_execute(input, options).await
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome.map_err(|e| self.classifier.handle_error(e)),
            Err(payload) => Err(self.classifier.handle_error(RawFailure::Panic(payload))),
        }
    }

    fn report_failure(&self, module_id: &str, error: &ModuleError) {
        let report = self.classifier.create_error_report(Some(module_id), error);
        match report.severity {
            Severity::Critical => tracing::error!(
                module_id = %module_id,
                code = %error.code,
                error = %error.message,
                "module call failed"
            ),
            Severity::Warning => tracing::warn!(
                module_id = %module_id,
                code = %error.code,
                error = %error.message,
                "module call failed"
            ),
        }
        self.events.publish(RuntimeEvent::ErrorReported(report));
    }

    /// Health of a module, loading it first if needed.
    pub async fn health(&self, module_id: &str) -> Result<HealthReport> {
        let instance = self.loader.load_module(module_id, None).await?;
        Ok(instance.health().await)
    }

    /// Apply the update source's latest descriptor and drop the loaded
    /// instance so the next call picks it up.
    pub async fn update_module(&self, module_id: &str) -> Result<ModuleDescriptor> {
        let descriptor = self.registry.update_module(module_id).await?;
        self.loader.unload_module(module_id).await;
        Ok(descriptor)
    }

    /// Forget a module and unload it.
    pub async fn unregister_module(&self, module_id: &str) -> Result<ModuleDescriptor> {
        let descriptor = self.registry.unregister_module(module_id)?;
        self.loader.unload_module(module_id).await;
        Ok(descriptor)
    }

    /// Unload every module.
    pub async fn shutdown(&self) {
        self.loader.clear().await;
        tracing::info!("module runtime shut down");
    }
}

impl<F: ModuleFactory> std::fmt::Debug for ModuleRuntime<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRuntime")
            .field("registry", &self.registry)
            .field("loader", &self.loader)
            .field("recovery", &self.recovery)
            .finish()
    }
}
