//! The module capability contract.
//!
//! Every sandboxed execution unit implements [`Module`].  The runtime never
//! inspects a module beyond this trait: it initializes it once, executes it
//! under resource ceilings, asks it for metadata and health, and disposes of
//! it when the instance is dropped from the loader.
//!
//! [`ModuleFactory`] is the seam between the loader and concrete module
//! types.  The set of module types a runtime can materialize is fixed by its
//! factory's associated [`ModuleFactory::Module`] type, so dispatch is static.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ResolvedConfig;
use crate::descriptor::ModuleDescriptor;
use crate::error::Result;

// ---------------------------------------------------------------------------
// Execute options
// ---------------------------------------------------------------------------

/// Per-call options passed to [`Module::execute`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// The operation to perform (e.g. `"format"`, `"validate"`).
    pub operation: String,
    /// Operation-specific parameters.
    #[serde(default, flatten)]
    pub params: Map<String, Value>,
}

impl ExecuteOptions {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Look up a parameter, falling back to the instance option of the same
    /// name.
    pub fn param<'a>(&'a self, key: &str, config: &'a ResolvedConfig) -> Option<&'a Value> {
        self.params.get(key).or_else(|| config.options.get(key))
    }
}

// ---------------------------------------------------------------------------
// Module output
// ---------------------------------------------------------------------------

/// What a module hands back from a successful execution.
///
/// Modules that can measure their own resource usage (wasm guests) fill in
/// the optional fields; the instance estimates the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleOutput {
    pub data: Value,
    /// Peak memory used by the call, in bytes.
    pub memory_peak: Option<u64>,
    /// Time spent computing, excluding scheduling delays.
    pub cpu_time: Option<Duration>,
}

impl ModuleOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            memory_peak: None,
            cpu_time: None,
        }
    }

    pub fn with_memory_peak(mut self, bytes: u64) -> Self {
        self.memory_peak = Some(bytes);
        self
    }

    pub fn with_cpu_time(mut self, elapsed: Duration) -> Self {
        self.cpu_time = Some(elapsed);
        self
    }
}

impl From<Value> for ModuleOutput {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

// ---------------------------------------------------------------------------
// Metadata & health
// ---------------------------------------------------------------------------

/// Self-description reported by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub category: String,
    pub description: String,
    /// Operations accepted by [`Module::execute`].
    pub operations: Vec<String>,
}

impl ModuleMetadata {
    /// Build metadata from a descriptor plus the module's operation list.
    pub fn from_descriptor(descriptor: &ModuleDescriptor, operations: &[&str]) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            category: descriptor.category.clone(),
            description: descriptor.description.clone(),
            operations: operations.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time health snapshot.  Not cached by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    /// How long the health probe took.
    pub response_time: Duration,
}

impl HealthReport {
    pub fn new(status: HealthStatus, response_time: Duration) -> Self {
        Self {
            status,
            last_check: Utc::now(),
            response_time,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// Capability set shared by every module.
///
/// `execute` takes `&self` and may be called concurrently; implementations
/// keep per-call state on the stack.  Resource ceilings are enforced by
/// [`ModuleInstance`](crate::instance::ModuleInstance), not by the module.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Prepare the module.  Called exactly once per instance.
    async fn initialize(&self, config: &ResolvedConfig) -> Result<()>;

    /// Run one operation over `input`.
    async fn execute(&self, input: Value, options: &ExecuteOptions) -> Result<ModuleOutput>;

    /// Release sandbox resources.  Must tolerate a failed or partial
    /// `initialize`.
    async fn dispose(&self);

    fn metadata(&self) -> ModuleMetadata;

    async fn health(&self) -> HealthReport;

    /// Host/version compatibility, consulted before `initialize`.
    fn is_compatible(&self) -> bool;
}

/// Materializes modules from descriptors.
#[async_trait]
pub trait ModuleFactory: Send + Sync + 'static {
    /// The concrete module type this factory produces.
    type Module: Module;

    /// Create an uninitialized module for `descriptor`.
    async fn create(&self, descriptor: &ModuleDescriptor) -> Result<Self::Module>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;

    #[test]
    fn options_flatten_params() {
        let opts: ExecuteOptions =
            serde_json::from_str(r#"{"operation": "format", "indent": 4}"#).unwrap();
        assert_eq!(opts.operation, "format");
        assert_eq!(opts.params["indent"], 4);
    }

    #[test]
    fn param_falls_back_to_config_option() {
        let config = ModuleConfig::new().with_option("indent", 8).resolve("m");
        let opts = ExecuteOptions::new("format");
        assert_eq!(opts.param("indent", &config), Some(&Value::from(8)));

        let opts = opts.with_param("indent", 2);
        assert_eq!(opts.param("indent", &config), Some(&Value::from(2)));
    }

    #[test]
    fn health_status_serializes_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
