//! Error classification.
//!
//! Every failure that reaches the runtime -- a module-reported
//! [`ModuleError`], a sandbox failure, a panicked task, a foreign error type
//! or a bare message -- is funnelled through [`ErrorClassifier::handle_error`]
//! and comes out as exactly one [`ModuleError`].  The classifier also scores
//! severity and packages [`ErrorReport`]s for the observability sink.

use std::any::Any;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ModuleError, SandboxError};

/// Message used when a failure carries no text at all.
const UNKNOWN_ERROR_MESSAGE: &str = "unknown error";

/// Anything the runtime may have to normalize.
#[derive(Debug)]
pub enum RawFailure {
    /// Already typed; passed through.
    Module(ModuleError),
    /// Low-level sandbox or fetch failure.
    Sandbox(SandboxError),
    /// A module task panicked or was cancelled.
    Join(tokio::task::JoinError),
    /// A panic payload caught on the calling task.
    Panic(Box<dyn Any + Send>),
    /// Some other error type.
    Foreign(Box<dyn std::error::Error + Send + Sync>),
    /// A bare value with no structure beyond its text.
    Message(String),
}

impl From<ModuleError> for RawFailure {
    fn from(e: ModuleError) -> Self {
        Self::Module(e)
    }
}

impl From<SandboxError> for RawFailure {
    fn from(e: SandboxError) -> Self {
        Self::Sandbox(e)
    }
}

impl From<tokio::task::JoinError> for RawFailure {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for RawFailure {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Foreign(e)
    }
}

impl From<String> for RawFailure {
    fn from(s: String) -> Self {
        Self::Message(s)
    }
}

impl From<&str> for RawFailure {
    fn from(s: &str) -> Self {
        Self::Message(s.to_owned())
    }
}

/// Two-level severity used for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
}

/// A packaged failure for logging/metrics consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub timestamp: DateTime<Utc>,
    pub module_id: Option<String>,
    pub error: ModuleError,
    pub severity: Severity,
    pub suggestions: Vec<String>,
}

/// Stateless failure normalizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Normalize any failure into a [`ModuleError`] with a non-empty code,
    /// message and suggestion list.
    pub fn handle_error(&self, raw: impl Into<RawFailure>) -> ModuleError {
        let mut err = match raw.into() {
            RawFailure::Module(e) => e,
            RawFailure::Sandbox(e) => classify_sandbox(e),
            RawFailure::Join(e) if e.is_panic() => panic_error(e.into_panic()),
            RawFailure::Join(_) => {
                ModuleError::new(ErrorCode::HostRuntimeError, "module task was cancelled")
            }
            RawFailure::Panic(payload) => panic_error(payload),
            RawFailure::Foreign(e) => ModuleError::new(ErrorCode::HostRuntimeError, e.to_string()),
            RawFailure::Message(msg) => ModuleError::new(ErrorCode::HostRuntimeError, msg),
        };

        if err.message.trim().is_empty() {
            err.message = UNKNOWN_ERROR_MESSAGE.to_owned();
        }
        if err.suggestions.is_empty() {
            err.suggestions = err.code.default_suggestions();
        }
        err
    }

    /// Deterministic severity for an error code.
    pub fn severity(&self, error: &ModuleError) -> Severity {
        match error.code {
            ErrorCode::LoadFailed
            | ErrorCode::InitializationError
            | ErrorCode::CorruptionError
            | ErrorCode::IncompatibleModule
            | ErrorCode::MemoryLimitExceeded
            | ErrorCode::HostRuntimeError => Severity::Critical,
            ErrorCode::TimeoutError
            | ErrorCode::ExecutionError
            | ErrorCode::PerformanceWarning
            | ErrorCode::ModuleNotFound
            | ErrorCode::CircuitOpen
            | ErrorCode::InvalidInput
            | ErrorCode::NetworkError => Severity::Warning,
        }
    }

    /// Bundle an error for the observability sink.
    pub fn create_error_report(&self, module_id: Option<&str>, error: &ModuleError) -> ErrorReport {
        ErrorReport {
            timestamp: Utc::now(),
            module_id: module_id.map(str::to_owned),
            error: error.clone(),
            severity: self.severity(error),
            suggestions: error.suggestions.clone(),
        }
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> ModuleError {
    let text = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_default();
    ModuleError::new(ErrorCode::HostRuntimeError, format!("module panicked: {text}"))
}

/// Map a sandbox failure onto the error taxonomy.
fn classify_sandbox(err: SandboxError) -> ModuleError {
    let message = err.to_string();
    match err {
        SandboxError::Compilation(_) => ModuleError::new(ErrorCode::CorruptionError, message),
        SandboxError::ChecksumMismatch { expected, actual } => {
            ModuleError::new(ErrorCode::CorruptionError, message)
                .with_detail("expected", expected)
                .with_detail("actual", actual)
        }
        SandboxError::Instantiation(_) => {
            ModuleError::new(ErrorCode::InitializationError, message)
        }
        SandboxError::Execution(_) | SandboxError::Trap(_) => {
            ModuleError::new(ErrorCode::ExecutionError, message)
        }
        SandboxError::FuelExhausted { budget } => {
            ModuleError::new(ErrorCode::ExecutionError, message)
                .with_detail("fuel_budget", budget)
                .with_suggestions([
                    "The program did not finish within its instruction budget",
                    "Check for infinite loops or reduce the workload",
                ])
        }
        SandboxError::Timeout { limit_ms } => {
            ModuleError::new(ErrorCode::TimeoutError, message).with_detail("timeout_ms", limit_ms)
        }
        SandboxError::MemoryLimit { requested, limit } => {
            ModuleError::new(ErrorCode::MemoryLimitExceeded, message)
                .with_detail("requested", requested as u64)
                .with_detail("limit", limit as u64)
        }
        SandboxError::Fetch(_) | SandboxError::Io(_) => {
            ModuleError::new(ErrorCode::NetworkError, message)
        }
    }
}

impl From<SandboxError> for ModuleError {
    fn from(err: SandboxError) -> Self {
        classify_sandbox(err)
    }
}
