//! The default module factory.
//!
//! [`ToolFactory`] turns a descriptor into a [`ToolModule`]: a built-in kind
//! for `Builtin` sources, a [`WasmModule`] for `Wasm` sources.  One
//! [`WasmSandbox`] engine is shared by every module it creates.

use async_trait::async_trait;
use serde_json::Value;

use crate::builtin::BuiltinModule;
use crate::config::ResolvedConfig;
use crate::descriptor::{ModuleDescriptor, ModuleSource};
use crate::error::Result;
use crate::module::{
    ExecuteOptions, HealthReport, Module, ModuleFactory, ModuleMetadata, ModuleOutput,
};
use crate::sandbox::WasmSandbox;
use crate::wasm_module::WasmModule;

/// Every module type the default runtime can materialize.
pub enum ToolModule {
    Builtin(BuiltinModule),
    Wasm(WasmModule),
}

#[async_trait]
impl Module for ToolModule {
    async fn initialize(&self, config: &ResolvedConfig) -> Result<()> {
        match self {
            Self::Builtin(m) => m.initialize(config).await,
            Self::Wasm(m) => m.initialize(config).await,
        }
    }

    async fn execute(&self, input: Value, options: &ExecuteOptions) -> Result<ModuleOutput> {
        match self {
            Self::Builtin(m) => m.execute(input, options).await,
            Self::Wasm(m) => m.execute(input, options).await,
        }
    }

    async fn dispose(&self) {
        match self {
            Self::Builtin(m) => m.dispose().await,
            Self::Wasm(m) => m.dispose().await,
        }
    }

    fn metadata(&self) -> ModuleMetadata {
        match self {
            Self::Builtin(m) => m.metadata(),
            Self::Wasm(m) => m.metadata(),
        }
    }

    async fn health(&self) -> HealthReport {
        match self {
            Self::Builtin(m) => m.health().await,
            Self::Wasm(m) => m.health().await,
        }
    }

    fn is_compatible(&self) -> bool {
        match self {
            Self::Builtin(m) => m.is_compatible(),
            Self::Wasm(m) => m.is_compatible(),
        }
    }
}

/// Creates [`ToolModule`]s from descriptors.
#[derive(Clone)]
pub struct ToolFactory {
    sandbox: WasmSandbox,
}

impl ToolFactory {
    pub fn new(sandbox: WasmSandbox) -> Self {
        Self { sandbox }
    }

    /// A factory with a freshly configured sandbox engine.
    pub fn with_default_sandbox() -> Result<Self> {
        Ok(Self::new(WasmSandbox::new()?))
    }

    pub fn sandbox(&self) -> &WasmSandbox {
        &self.sandbox
    }
}

#[async_trait]
impl ModuleFactory for ToolFactory {
    type Module = ToolModule;

    async fn create(&self, descriptor: &ModuleDescriptor) -> Result<ToolModule> {
        match &descriptor.source {
            ModuleSource::Builtin { kind } => Ok(ToolModule::Builtin(BuiltinModule::new(
                *kind,
                descriptor.clone(),
                self.sandbox.clone(),
            ))),
            ModuleSource::Wasm { .. } => Ok(ToolModule::Wasm(WasmModule::new(
                descriptor.clone(),
                self.sandbox.clone(),
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinKind;

    #[tokio::test]
    async fn builtin_sources_become_builtin_modules() {
        let factory = ToolFactory::with_default_sandbox().unwrap();
        let m = factory
            .create(&BuiltinKind::JsonValidator.descriptor())
            .await
            .unwrap();
        assert!(matches!(&m, ToolModule::Builtin(b) if b.kind() == BuiltinKind::JsonValidator));
        assert_eq!(m.metadata().operations, vec!["validate".to_owned()]);
    }

    #[tokio::test]
    async fn wasm_sources_become_wasm_modules() {
        let factory = ToolFactory::with_default_sandbox().unwrap();
        let d = ModuleDescriptor::new(
            "crc32",
            "CRC32",
            "1.0.0",
            "wasm",
            ModuleSource::Wasm {
                location: "file:///opt/crc32.wasm".into(),
            },
        );
        let m = factory.create(&d).await.unwrap();
        assert!(matches!(m, ToolModule::Wasm(_)));
        assert!(m.is_compatible());
    }
}
