//! Runtime error types.
//!
//! Two error types live here:
//!
//! - [`ModuleError`] is the normalized failure shape every caller of the
//!   runtime sees.  It carries a stable [`ErrorCode`], a human-readable
//!   message, free-form details, a `recoverable` flag, and remediation
//!   suggestions.
//! - [`SandboxError`] enumerates the low-level failure modes of the wasm
//!   sandbox and of module source fetching.  It never crosses the runtime
//!   facade; the classifier turns it into a [`ModuleError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Stable, machine-readable identifier for a failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The module reference could not be resolved or materialized.
    LoadFailed,
    /// The module's `initialize` step failed.
    InitializationError,
    /// Execution exceeded the configured wall-clock ceiling.
    TimeoutError,
    /// The module reported a failure while executing.
    ExecutionError,
    /// The module artifact is malformed or failed its integrity check.
    CorruptionError,
    /// Advisory: execution was close to its resource ceilings.
    PerformanceWarning,
    /// Execution exceeded the configured memory ceiling.
    MemoryLimitExceeded,
    /// The registry has no module with the requested id.
    ModuleNotFound,
    /// The module declared itself incompatible with this host.
    IncompatibleModule,
    /// The module's circuit breaker is open; the call was not attempted.
    CircuitOpen,
    /// The caller supplied input the module cannot process.
    InvalidInput,
    /// A transient I/O failure while fetching a module or catalog.
    NetworkError,
    /// Catch-all for unclassified host failures (panics, foreign errors).
    HostRuntimeError,
}

impl ErrorCode {
    /// The wire representation, e.g. `"LOAD_FAILED"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadFailed => "LOAD_FAILED",
            Self::InitializationError => "INITIALIZATION_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::CorruptionError => "CORRUPTION_ERROR",
            Self::PerformanceWarning => "PERFORMANCE_WARNING",
            Self::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Self::ModuleNotFound => "MODULE_NOT_FOUND",
            Self::IncompatibleModule => "INCOMPATIBLE_MODULE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::InvalidInput => "INVALID_INPUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::HostRuntimeError => "HOST_RUNTIME_ERROR",
        }
    }

    /// Whether failures with this code are worth retrying by default.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TimeoutError | Self::PerformanceWarning | Self::NetworkError
        )
    }

    /// Default remediation hints shown to the user for this code.
    pub fn default_suggestions(&self) -> Vec<String> {
        let hints: &[&str] = match self {
            Self::LoadFailed => &[
                "Check that the module id is spelled correctly",
                "Verify the module is registered and its dependencies are available",
            ],
            Self::InitializationError => &[
                "Reload the module",
                "Check the module configuration for invalid options",
            ],
            Self::TimeoutError => &[
                "Try again with a smaller input",
                "Increase the module timeout",
            ],
            Self::ExecutionError => &[
                "Check the input format",
                "Verify the requested operation is supported by the module",
            ],
            Self::CorruptionError => &[
                "Re-download the module artifact",
                "Verify the module checksum",
            ],
            Self::PerformanceWarning => &["Consider reducing the input size"],
            Self::MemoryLimitExceeded => &[
                "Reduce the input size",
                "Increase the module memory limit",
            ],
            Self::ModuleNotFound => &["List available modules and pick a registered id"],
            Self::IncompatibleModule => &["Update the module to a version built for this host"],
            Self::CircuitOpen => &[
                "The module is failing repeatedly; wait before retrying",
                "Use an alternate module if one is available",
            ],
            Self::InvalidInput => &["Check the input against the operation's expected format"],
            Self::NetworkError => &[
                "Check network connectivity",
                "Retry the request",
            ],
            Self::HostRuntimeError => &["Retry the operation", "Report the problem if it persists"],
        };
        hints.iter().map(|s| (*s).to_owned()).collect()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ModuleError
// ---------------------------------------------------------------------------

/// The normalized failure shape surfaced by the runtime.
///
/// Build one with [`ModuleError::new`] and refine it with the `with_*`
/// methods.  The `recoverable` flag defaults to [`ErrorCode::is_transient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ModuleError {
    /// Stable machine-readable identifier.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Free-form context (module id, limits, underlying cause...).
    #[serde(default)]
    pub details: Value,
    /// Whether the recovery policy may retry the failed call.
    pub recoverable: bool,
    /// Ordered remediation hints.
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ModuleError {
    /// Create an error with code-derived defaults for `recoverable` and
    /// `suggestions`.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Null,
            recoverable: code.is_transient(),
            suggestions: code.default_suggestions(),
        }
    }

    /// Attach a detail entry.  Details are kept as a JSON object.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.details.is_object() {
            self.details = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.details {
            map.insert(key.to_owned(), value.into());
        }
        self
    }

    /// Override the recoverable flag.
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Replace the suggestion list.
    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions = suggestions.into_iter().map(Into::into).collect();
        self
    }

    /// Wrap this error as a `LOAD_FAILED` for `module_id`, keeping the
    /// original code and message as the cause.
    pub fn into_load_failure(self, module_id: &str) -> Self {
        if self.code == ErrorCode::LoadFailed {
            return self;
        }
        let cause = self.code;
        let mut suggestions = ErrorCode::LoadFailed.default_suggestions();
        for s in self.suggestions {
            if !suggestions.contains(&s) {
                suggestions.push(s);
            }
        }
        ModuleError::new(
            ErrorCode::LoadFailed,
            format!("failed to load module '{module_id}': {}", self.message),
        )
        .with_detail("module_id", module_id)
        .with_detail("cause", cause.as_str())
        .with_recoverable(self.recoverable)
        .with_suggestions(suggestions)
    }

    /// Shorthand for a `LOAD_FAILED` error about `module_id`.
    pub fn load_failed(module_id: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::LoadFailed, message).with_detail("module_id", module_id)
    }

    /// Shorthand for an `INVALID_INPUT` error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Shorthand for an `EXECUTION_ERROR`.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionError, message)
    }

    /// The underlying cause recorded by [`into_load_failure`](Self::into_load_failure), if any.
    pub fn cause(&self) -> Option<&str> {
        self.details.get("cause").and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// SandboxError
// ---------------------------------------------------------------------------

/// Low-level failures of the wasm sandbox and of module source fetching.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Wasm module failed to compile (e.g. invalid bytecode).
    #[error("wasm compilation error: {0}")]
    Compilation(String),

    /// Wasm module could not be instantiated (e.g. missing imports).
    #[error("wasm instantiation error: {0}")]
    Instantiation(String),

    /// A Wasm function call returned an error.
    #[error("wasm execution error: {0}")]
    Execution(String),

    /// A Wasm trap was raised during execution.
    #[error("wasm trap: {0}")]
    Trap(String),

    /// The fuel budget ran out before the guest finished.
    #[error("fuel exhausted after {budget} units")]
    FuelExhausted {
        /// The configured fuel budget.
        budget: u64,
    },

    /// Execution exceeded the configured time limit.
    #[error("timeout: execution exceeded {limit_ms}ms")]
    Timeout {
        /// The configured limit in milliseconds.
        limit_ms: u64,
    },

    /// The Wasm module tried to use more memory than allowed.
    #[error("memory limit exceeded: {requested} > {limit}")]
    MemoryLimit {
        /// Requested memory in bytes.
        requested: usize,
        /// Configured maximum in bytes.
        limit: usize,
    },

    /// The artifact's digest does not match the registered checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum recorded in the descriptor.
        expected: String,
        /// Digest of the fetched bytes.
        actual: String,
    },

    /// Fetching a remote artifact failed.
    #[error("fetch error: {0}")]
    Fetch(#[from] reqwest::Error),

    /// An I/O error occurred (e.g. reading a `.wasm` file from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the runtime crate.
pub type Result<T> = std::result::Result<T, ModuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::TimeoutError).unwrap();
        assert_eq!(json, "\"TIMEOUT_ERROR\"");
        let back: ErrorCode = serde_json::from_str("\"LOAD_FAILED\"").unwrap();
        assert_eq!(back, ErrorCode::LoadFailed);
    }

    #[test]
    fn display_matches_wire_name() {
        assert_eq!(ErrorCode::CircuitOpen.to_string(), "CIRCUIT_OPEN");
        let err = ModuleError::new(ErrorCode::ExecutionError, "bad input");
        assert_eq!(err.to_string(), "EXECUTION_ERROR: bad input");
    }

    #[test]
    fn new_derives_recoverable_from_code() {
        assert!(ModuleError::new(ErrorCode::TimeoutError, "slow").recoverable);
        assert!(ModuleError::new(ErrorCode::NetworkError, "reset").recoverable);
        assert!(!ModuleError::new(ErrorCode::CorruptionError, "bad").recoverable);
        assert!(!ModuleError::new(ErrorCode::InitializationError, "boom").recoverable);
    }

    #[test]
    fn new_fills_suggestions() {
        let err = ModuleError::new(ErrorCode::MemoryLimitExceeded, "too big");
        assert!(!err.suggestions.is_empty());
    }

    #[test]
    fn details_accumulate() {
        let err = ModuleError::execution("x")
            .with_detail("module_id", "json-formatter")
            .with_detail("attempt", 2);
        assert_eq!(err.details["module_id"], "json-formatter");
        assert_eq!(err.details["attempt"], 2);
    }

    #[test]
    fn load_failure_keeps_cause() {
        let err = ModuleError::new(ErrorCode::InitializationError, "init blew up")
            .into_load_failure("json-validator");
        assert_eq!(err.code, ErrorCode::LoadFailed);
        assert_eq!(err.cause(), Some("INITIALIZATION_ERROR"));
        assert!(err.message.contains("init blew up"));
        assert_eq!(err.details["module_id"], "json-validator");
    }

    #[test]
    fn load_failure_is_not_double_wrapped() {
        let err = ModuleError::load_failed("a", "nope").into_load_failure("b");
        assert_eq!(err.message, "nope");
        assert!(err.cause().is_none());
    }

    #[test]
    fn sandbox_error_display() {
        let err = SandboxError::Timeout { limit_ms: 5000 };
        assert_eq!(err.to_string(), "timeout: execution exceeded 5000ms");
        let err = SandboxError::MemoryLimit {
            requested: 32_000_000,
            limit: 16_000_000,
        };
        assert_eq!(err.to_string(), "memory limit exceeded: 32000000 > 16000000");
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file gone");
        let sandbox_err = SandboxError::from(io_err);
        assert!(sandbox_err.to_string().contains("file gone"));
    }
}
