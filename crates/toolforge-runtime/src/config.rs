//! Module and runtime configuration.
//!
//! [`ModuleConfig`] is the caller-supplied, per-module configuration applied
//! at first load.  It is deliberately permissive: values that make no sense
//! (non-positive limits, unknown log levels) are accepted and replaced with
//! safe defaults by [`ModuleConfig::resolve`], which logs a warning for each
//! correction.  [`ResolvedConfig`] is what modules actually see.
//!
//! [`RuntimeConfig`] groups the knobs of the runtime facade itself.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::recovery::RecoveryConfig;

/// Default linear-memory ceiling for a module: 16 MiB.
pub const DEFAULT_MAX_MEMORY: u64 = 16 * 1024 * 1024;

/// Default wall-clock ceiling for a single execution: 5 seconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default fuel budget for wasm executions.
pub const DEFAULT_MAX_FUEL: u64 = 10_000_000;

// ---------------------------------------------------------------------------
// Log level
// ---------------------------------------------------------------------------

/// Log verbosity requested for a module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unrecognized log level '{other}'")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Module configuration
// ---------------------------------------------------------------------------

/// Caller-supplied configuration for a module instance.
///
/// Every field is optional.  Numeric limits are signed so that configuration
/// files carrying nonsense values still deserialize; [`resolve`](Self::resolve)
/// clamps them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Memory ceiling in bytes.
    pub max_memory: Option<i64>,
    /// Wall-clock ceiling per execution, in milliseconds.
    pub timeout_ms: Option<i64>,
    /// Enable verbose module diagnostics.
    pub debug: bool,
    /// Requested log level (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,
    /// Free-form module options.
    pub options: Map<String, Value>,
}

impl ModuleConfig {
    /// Create an empty configuration (all defaults).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory ceiling (in bytes).
    pub fn with_max_memory(mut self, bytes: i64) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Set the execution timeout (in milliseconds).
    pub fn with_timeout_ms(mut self, ms: i64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Enable or disable debug mode.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the log level by name.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Set a single free-form option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Fill unset fields from `defaults`.
    pub fn merged_over(mut self, defaults: &ModuleConfig) -> Self {
        if self.max_memory.is_none() {
            self.max_memory = defaults.max_memory;
        }
        if self.timeout_ms.is_none() {
            self.timeout_ms = defaults.timeout_ms;
        }
        if self.log_level.is_none() {
            self.log_level = defaults.log_level.clone();
        }
        self.debug |= defaults.debug;
        for (k, v) in &defaults.options {
            self.options.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    /// Turn this configuration into concrete limits.
    ///
    /// Never fails.  Invalid values are replaced with defaults and a warning
    /// is logged for `module_id`.
    pub fn resolve(&self, module_id: &str) -> ResolvedConfig {
        let max_memory = match self.max_memory {
            None => DEFAULT_MAX_MEMORY,
            Some(v) if v > 0 => v as u64,
            Some(v) => {
                tracing::warn!(
                    module_id,
                    max_memory = v,
                    default = DEFAULT_MAX_MEMORY,
                    "non-positive max_memory, using default"
                );
                DEFAULT_MAX_MEMORY
            }
        };

        let timeout_ms = match self.timeout_ms {
            None => DEFAULT_TIMEOUT_MS,
            Some(v) if v > 0 => v as u64,
            Some(v) => {
                tracing::warn!(
                    module_id,
                    timeout_ms = v,
                    default = DEFAULT_TIMEOUT_MS,
                    "non-positive timeout, using default"
                );
                DEFAULT_TIMEOUT_MS
            }
        };

        let log_level = match self.log_level.as_deref() {
            None => LogLevel::default(),
            Some(raw) => raw.parse().unwrap_or_else(|reason: String| {
                tracing::warn!(module_id, %reason, "falling back to info log level");
                LogLevel::Info
            }),
        };

        ResolvedConfig {
            max_memory,
            timeout: Duration::from_millis(timeout_ms),
            debug: self.debug,
            log_level,
            options: self.options.clone(),
        }
    }
}

/// Concrete, validated limits for a module instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// Memory ceiling in bytes (always > 0).
    pub max_memory: u64,
    /// Wall-clock ceiling per execution (always > 0).
    pub timeout: Duration,
    pub debug: bool,
    pub log_level: LogLevel,
    pub options: Map<String, Value>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        ModuleConfig::default().resolve("default")
    }
}

impl ResolvedConfig {
    /// Read a numeric option, e.g. the fuel budget for wasm modules.
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }
}

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Configuration of the runtime facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Configuration applied to modules loaded without an explicit one, and
    /// used to fill unset fields of explicit ones.
    pub defaults: ModuleConfig,
    /// Retry, circuit breaker and backoff settings.
    pub recovery: RecoveryConfig,
    /// Capacity of the runtime event channel.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            defaults: ModuleConfig::default(),
            recovery: RecoveryConfig::default(),
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_resolves_to_defaults() {
        let resolved = ModuleConfig::new().resolve("m");
        assert_eq!(resolved.max_memory, DEFAULT_MAX_MEMORY);
        assert_eq!(resolved.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(resolved.log_level, LogLevel::Info);
        assert!(!resolved.debug);
    }

    #[test]
    fn valid_values_pass_through() {
        let resolved = ModuleConfig::new()
            .with_max_memory(1024)
            .with_timeout_ms(250)
            .with_log_level("DEBUG")
            .with_debug(true)
            .resolve("m");
        assert_eq!(resolved.max_memory, 1024);
        assert_eq!(resolved.timeout, Duration::from_millis(250));
        assert_eq!(resolved.log_level, LogLevel::Debug);
        assert!(resolved.debug);
    }

    #[test]
    fn non_positive_limits_are_clamped() {
        let resolved = ModuleConfig::new()
            .with_max_memory(-1)
            .with_timeout_ms(0)
            .resolve("m");
        assert_eq!(resolved.max_memory, DEFAULT_MAX_MEMORY);
        assert_eq!(resolved.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let resolved = ModuleConfig::new().with_log_level("verbose").resolve("m");
        assert_eq!(resolved.log_level, LogLevel::Info);
    }

    #[test]
    fn merged_over_fills_only_unset_fields() {
        let defaults = ModuleConfig::new()
            .with_timeout_ms(100)
            .with_max_memory(2048)
            .with_option("indent", 4);
        let cfg = ModuleConfig::new()
            .with_timeout_ms(900)
            .with_option("indent", 2)
            .merged_over(&defaults);
        assert_eq!(cfg.timeout_ms, Some(900));
        assert_eq!(cfg.max_memory, Some(2048));
        assert_eq!(cfg.options["indent"], 2);
    }

    #[test]
    fn negative_values_deserialize() {
        let cfg: ModuleConfig =
            serde_json::from_str(r#"{"max_memory": -5, "timeout_ms": -10, "log_level": "loud"}"#)
                .unwrap();
        let resolved = cfg.resolve("m");
        assert_eq!(resolved.max_memory, DEFAULT_MAX_MEMORY);
        assert_eq!(resolved.log_level, LogLevel::Info);
    }

    #[test]
    fn option_u64_reads_numbers() {
        let resolved = ModuleConfig::new().with_option("max_fuel", 42).resolve("m");
        assert_eq!(resolved.option_u64("max_fuel"), Some(42));
        assert_eq!(resolved.option_u64("missing"), None);
    }

    #[test]
    fn runtime_config_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.event_capacity, 256);
        assert_eq!(cfg.recovery.max_attempts, 3);
    }
}
