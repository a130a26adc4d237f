//! Module loader.
//!
//! The loader owns every *instantiated* module.  Its table maps a module key
//! (registry id, or the full location for modules loaded by URL) to a slot
//! that is either still loading or ready:
//!
//! - The `Loading` slot is inserted before anything is materialized and
//!   holds a [`Shared`] future, so concurrent loads of one id await the same
//!   work and receive the same [`Arc`].
//! - When the load settles, the slot becomes `Ready` only if it still holds
//!   the same generation.  A module unloaded mid-load is disposed and the
//!   load reports `LOAD_FAILED`.
//! - A failed load removes its slot, so a later call tries again.
//!
//! Dependencies are resolved through the registry before the module itself
//! is created and are loaded first, in topological order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};

use crate::classifier::ErrorClassifier;
use crate::config::ModuleConfig;
use crate::descriptor::ModuleDescriptor;
use crate::error::{ErrorCode, ModuleError, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::instance::ModuleInstance;
use crate::module::{Module, ModuleFactory};
use crate::registry::ModuleRegistry;
use crate::source::{ModuleRef, descriptor_for_location};

type Instance<F> = Arc<ModuleInstance<<F as ModuleFactory>::Module>>;
type LoadFuture<F> = Shared<BoxFuture<'static, Result<Instance<F>>>>;

enum Slot<F: ModuleFactory> {
    Loading {
        generation: u64,
        future: LoadFuture<F>,
    },
    Ready(Instance<F>),
}

struct LoaderInner<F: ModuleFactory> {
    factory: F,
    registry: ModuleRegistry,
    defaults: ModuleConfig,
    events: EventBus,
    slots: DashMap<String, Slot<F>>,
    next_generation: AtomicU64,
}

/// Loads, caches and unloads module instances.
///
/// Cheaply cloneable; clones share one instance table.
pub struct ModuleLoader<F: ModuleFactory> {
    inner: Arc<LoaderInner<F>>,
}

impl<F: ModuleFactory> Clone for ModuleLoader<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ModuleFactory> ModuleLoader<F> {
    /// Create a loader.  `defaults` fills fields a load-time config leaves
    /// unset.
    pub fn new(registry: ModuleRegistry, factory: F, defaults: ModuleConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                factory,
                registry,
                defaults,
                events,
                slots: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    /// Load a module, or return the cached instance.
    ///
    /// `reference` is a registry id or a `file://` / `http(s)://` location of
    /// a `.wasm` artifact.  `config` only applies to the load that actually
    /// materializes the module; later calls get the cached instance
    /// unchanged.
    pub async fn load_module(
        &self,
        reference: &str,
        config: Option<ModuleConfig>,
    ) -> Result<Instance<F>> {
        let module_ref = ModuleRef::parse(reference)?;
        Self::load_ref(Arc::clone(&self.inner), module_ref, config).await
    }

    fn load_ref(
        inner: Arc<LoaderInner<F>>,
        module_ref: ModuleRef,
        config: Option<ModuleConfig>,
    ) -> BoxFuture<'static, Result<Instance<F>>> {
        async move {
            let key = module_ref.key();
            let future = match inner.slots.entry(key.clone()) {
                Entry::Occupied(entry) => match entry.get() {
                    Slot::Ready(instance) => return Ok(Arc::clone(instance)),
                    Slot::Loading { future, .. } => {
                        tracing::debug!(module_id = %key, "joining in-flight load");
                        future.clone()
                    }
                },
                Entry::Vacant(entry) => {
                    let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let future = Self::materialize(
                        Arc::clone(&inner),
                        module_ref,
                        key.clone(),
                        generation,
                        config,
                    )
                    .boxed()
                    .shared();
                    entry.insert(Slot::Loading {
                        generation,
                        future: future.clone(),
                    });
                    future
                }
            };
            future.await
        }
        .boxed()
    }

    async fn materialize(
        inner: Arc<LoaderInner<F>>,
        module_ref: ModuleRef,
        key: String,
        generation: u64,
        config: Option<ModuleConfig>,
    ) -> Result<Instance<F>> {
        let outcome = Self::build(&inner, &module_ref, &key, config).await;

        let instance = match outcome {
            Ok(instance) => instance,
            Err(err) => {
                inner.slots.remove_if(&key, |_, slot| {
                    matches!(slot, Slot::Loading { generation: g, .. } if *g == generation)
                });
                tracing::warn!(module_id = %key, code = %err.code, error = %err.message, "module load failed");
                return Err(err);
            }
        };

        let claimed = match inner.slots.get_mut(&key) {
            Some(mut slot) => {
                let ours = matches!(&*slot, Slot::Loading { generation: g, .. } if *g == generation);
                if ours {
                    *slot = Slot::Ready(Arc::clone(&instance));
                }
                ours
            }
            None => false,
        };
        if !claimed {
            tracing::info!(module_id = %key, "module unloaded while loading, discarding");
            instance.dispose().await;
            return Err(ModuleError::load_failed(
                &key,
                format!("module '{key}' was unloaded while loading"),
            ));
        }

        tracing::info!(
            module_id = %key,
            version = %instance.descriptor().version,
            load_time_ms = instance.load_time().as_millis() as u64,
            "module loaded"
        );
        inner.events.publish(RuntimeEvent::ModuleLoaded {
            module_id: key,
            version: instance.descriptor().version.clone(),
            load_time: instance.load_time(),
        });
        Ok(instance)
    }

    async fn build(
        inner: &Arc<LoaderInner<F>>,
        module_ref: &ModuleRef,
        key: &str,
        config: Option<ModuleConfig>,
    ) -> Result<Instance<F>> {
        let started = Instant::now();

        let descriptor: ModuleDescriptor = match module_ref {
            ModuleRef::Id(id) => inner.registry.get_module(id).ok_or_else(|| {
                ModuleError::load_failed(id, format!("module '{id}' is not registered"))
                    .with_suggestions([
                        "Check that the module id is spelled correctly",
                        "List available modules with `toolforge list`",
                    ])
            })?,
            ModuleRef::Location(url) => inner
                .registry
                .get_module(url.as_str())
                .unwrap_or_else(|| descriptor_for_location(url)),
        };

        let dependencies = if inner.registry.contains(key) {
            inner.registry.resolve_dependencies(key)?
        } else {
            Vec::new()
        };
        for dep in dependencies {
            tracing::debug!(module_id = %key, dependency = %dep, "loading dependency");
            let dep_ref = ModuleRef::parse(&dep).map_err(|e| e.into_load_failure(key))?;
            Self::load_ref(Arc::clone(inner), dep_ref, None)
                .await
                .map_err(|e| {
                    ModuleError::load_failed(
                        key,
                        format!("dependency '{dep}' of module '{key}' failed to load: {}", e.message),
                    )
                    .with_detail("dependency", dep.as_str())
                    .with_detail("cause", e.cause().unwrap_or(e.code.as_str()).to_owned())
                    .with_recoverable(e.recoverable)
                })?;
        }

        let resolved = config
            .unwrap_or_default()
            .merged_over(&inner.defaults)
            .resolve(key);

        let module = inner
            .factory
            .create(&descriptor)
            .await
            .map_err(|e| e.into_load_failure(key))?;

        if !module.is_compatible() {
            module.dispose().await;
            return Err(ModuleError::new(
                ErrorCode::IncompatibleModule,
                format!("module '{key}' is not compatible with this host"),
            )
            .into_load_failure(key));
        }

        if let Err(err) = module.initialize(&resolved).await {
            module.dispose().await;
            return Err(ErrorClassifier::new().handle_error(err).into_load_failure(key));
        }

        Ok(Arc::new(ModuleInstance::new(
            descriptor,
            module,
            resolved,
            started.elapsed(),
        )))
    }

    /// Dispose and evict a module.  Returns whether anything was loaded or
    /// loading under `id`.
    pub async fn unload_module(&self, id: &str) -> bool {
        let key = normalize_key(id);
        let Some((_, slot)) = self.inner.slots.remove(&key) else {
            return false;
        };
        match slot {
            Slot::Ready(instance) => {
                instance.dispose().await;
                tracing::info!(module_id = %key, "module unloaded");
            }
            Slot::Loading { .. } => {
                tracing::info!(module_id = %key, "module unloaded before its load settled");
            }
        }
        self.inner
            .events
            .publish(RuntimeEvent::ModuleUnloaded { module_id: key });
        true
    }

    /// Load several modules concurrently.  One result per id, in input
    /// order; a failure does not affect the others.
    pub async fn preload_modules<I, S>(&self, ids: I) -> Vec<(String, Result<Instance<F>>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        let results = join_all(ids.iter().map(|id| self.load_module(id, None))).await;
        let ok = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!(requested = ids.len(), loaded = ok, "preload finished");
        ids.into_iter().zip(results).collect()
    }

    /// The ready instance for `id`, without loading it.
    pub fn get(&self, id: &str) -> Option<Instance<F>> {
        match self.inner.slots.get(&normalize_key(id))?.value() {
            Slot::Ready(instance) => Some(Arc::clone(instance)),
            Slot::Loading { .. } => None,
        }
    }

    pub fn is_module_loaded(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Keys of all ready modules, sorted.
    pub fn loaded_modules(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Ready(_)))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Unload everything.
    pub async fn clear(&self) {
        let keys: Vec<String> = self.inner.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.unload_module(&key).await;
        }
    }
}

impl<F: ModuleFactory> std::fmt::Debug for ModuleLoader<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("slots", &self.inner.slots.len())
            .finish()
    }
}

/// Table key for a reference, falling back to the raw string.
fn normalize_key(reference: &str) -> String {
    ModuleRef::parse(reference)
        .map(|r| r.key())
        .unwrap_or_else(|_| reference.to_owned())
}
