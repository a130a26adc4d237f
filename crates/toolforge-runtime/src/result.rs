//! Execution results.
//!
//! [`ExecutionResult`] is the only thing callers of the runtime ever receive.
//! Its fields are private and it is built exclusively through
//! [`ExecutionResult::ok`] and [`ExecutionResult::failure`], so a successful
//! result never carries an error and a failed one never carries data.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, ModuleError};

/// Resource usage of a single execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Time spent inside the module (excludes queueing on the blocking pool).
    pub cpu_time: Duration,
    /// Wall-clock time of the whole call.
    pub wall_time: Duration,
    /// Peak memory attributed to the call, in bytes.
    pub memory_peak: u64,
}

/// What the recovery policy did on the way to this result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Whether recovery was attempted at all.
    pub attempted: bool,
    /// Whether recovery produced a successful result.
    pub success: bool,
    /// Total module invocations, including the first.
    pub attempts: u32,
    /// Codes of the failures that were retried rather than surfaced.
    pub retried: Vec<ErrorCode>,
    /// The fallback module that produced the final result, if any.
    pub fallback: Option<String>,
}

/// Outcome of one `execute` / `run` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ModuleError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<ExecutionMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery: Option<RecoveryReport>,
}

impl ExecutionResult {
    /// A successful result.
    pub fn ok(data: Value, metrics: Option<ExecutionMetrics>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metrics,
            recovery: None,
        }
    }

    /// A failed result.
    pub fn failure(error: ModuleError, metrics: Option<ExecutionMetrics>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metrics,
            recovery: None,
        }
    }

    pub fn with_recovery(mut self, report: RecoveryReport) -> Self {
        self.recovery = Some(report);
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&ModuleError> {
        self.error.as_ref()
    }

    pub fn metrics(&self) -> Option<&ExecutionMetrics> {
        self.metrics.as_ref()
    }

    pub fn recovery(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// The error code, if this is a failure.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Convert into a plain `Result`, dropping metrics.
    pub fn into_result(self) -> Result<Value, ModuleError> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(data),
            (_, Some(err)) => Err(err),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_has_no_error() {
        let r = ExecutionResult::ok(json!({"a": 1}), None);
        assert!(r.is_success());
        assert!(r.error().is_none());
        assert_eq!(r.data(), Some(&json!({"a": 1})));
    }

    #[test]
    fn failure_has_no_data() {
        let r = ExecutionResult::failure(ModuleError::execution("boom"), None);
        assert!(!r.is_success());
        assert!(r.data().is_none());
        assert_eq!(r.error_code(), Some(ErrorCode::ExecutionError));
    }

    #[test]
    fn into_result_maps_both_sides() {
        let ok = ExecutionResult::ok(json!(1), None).into_result();
        assert_eq!(ok.unwrap(), json!(1));
        let err = ExecutionResult::failure(ModuleError::execution("x"), None).into_result();
        assert_eq!(err.unwrap_err().code, ErrorCode::ExecutionError);
    }

    #[test]
    fn serialized_failure_omits_data() {
        let r = ExecutionResult::failure(ModuleError::execution("x"), None);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["success"], false);
        assert!(v.get("data").is_none());
        assert_eq!(v["error"]["code"], "EXECUTION_ERROR");
    }
}
