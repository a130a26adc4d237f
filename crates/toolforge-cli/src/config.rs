//! Application configuration.
//!
//! Read from `toolforge.toml` (or `--config`).  A missing file is not an
//! error; the built-in defaults apply.  `TOOLFORGE_UPDATE_URL` in the
//! environment (or a `.env` file) overrides the update catalog location.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use toolforge_runtime::{ModuleConfig, ModuleDescriptor, RuntimeConfig};

/// Environment variable overriding [`AppConfig::update_catalog_url`].
pub const UPDATE_URL_ENV: &str = "TOOLFORGE_UPDATE_URL";

/// Top-level configuration file layout.
///
/// ```toml
/// update_catalog_url = "https://tools.example.com/catalog.json"
///
/// [defaults]
/// timeout_ms = 2000
///
/// [runtime.recovery]
/// max_attempts = 5
///
/// [[modules]]
/// id = "slugify"
/// name = "Slugify"
/// version = "1.0.0"
/// category = "text"
/// source = { type = "wasm", location = "file:///opt/toolforge/slugify.wasm" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    /// Module defaults.  Fields set here win over `[runtime.defaults]`.
    pub defaults: ModuleConfig,
    pub update_catalog_url: Option<String>,
    /// Extra modules registered next to the built-ins.
    pub modules: Vec<ModuleDescriptor>,
}

impl AppConfig {
    /// Load the configuration file at `path`, or defaults if it does not
    /// exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        info!(
            path = %path.display(),
            modules = config.modules.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Apply environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_update_url_override(std::env::var(UPDATE_URL_ENV).ok())
    }

    fn with_update_url_override(mut self, value: Option<String>) -> Self {
        if let Some(url) = value.filter(|v| !v.trim().is_empty()) {
            info!(env = UPDATE_URL_ENV, "update catalog url overridden from environment");
            self.update_catalog_url = Some(url);
        }
        self
    }

    /// The runtime configuration with the top-level `[defaults]` folded in.
    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut runtime = self.runtime.clone();
        runtime.defaults = self.defaults.clone().merged_over(&self.runtime.defaults);
        runtime
    }

    /// The parsed update catalog location, if one is configured.
    pub fn update_url(&self) -> Result<Option<Url>> {
        self.update_catalog_url
            .as_deref()
            .map(|raw| Url::parse(raw).with_context(|| format!("invalid update_catalog_url '{raw}'")))
            .transpose()
    }
}
