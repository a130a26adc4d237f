//! Module registry.
//!
//! The registry holds the descriptor of every *known* module, whether or not
//! it is loaded.  It answers lookups and searches, computes dependency
//! orders for the loader, and talks to an [`UpdateSource`] for version
//! checks and hot updates.
//!
//! Backed by [`DashMap`] and cheaply cloneable; the loader and the runtime
//! facade share one registry.
//!
//! # Example
//!
//! ```rust
//! # use toolforge_runtime::registry::ModuleRegistry;
//! # use toolforge_runtime::builtin;
//! let registry = ModuleRegistry::new();
//! for descriptor in builtin::descriptors() {
//!     registry.register_module(descriptor);
//! }
//! assert!(registry.get_module("json-formatter").is_some());
//! assert!(!registry.search_modules("yaml").is_empty());
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use url::Url;

use crate::descriptor::{ModuleDescriptor, ModuleUpdate, compare_versions};
use crate::error::{ErrorCode, ModuleError, Result};
use crate::events::{EventBus, RuntimeEvent};

// ---------------------------------------------------------------------------
// Update sources
// ---------------------------------------------------------------------------

/// Where newer module versions are published.
#[async_trait]
pub trait UpdateSource: Send + Sync + 'static {
    /// Every descriptor the source knows about.
    async fn catalog(&self) -> Result<Vec<ModuleDescriptor>>;

    /// The latest descriptor for `id`, if the source has one.
    async fn latest(&self, id: &str) -> Result<Option<ModuleDescriptor>> {
        Ok(self.catalog().await?.into_iter().find(|d| d.id == id))
    }
}

/// In-memory catalog.  Useful for tests and for pinning versions from a
/// config file.
#[derive(Debug, Default, Clone)]
pub struct StaticUpdateSource {
    entries: Arc<DashMap<String, ModuleDescriptor>>,
}

impl StaticUpdateSource {
    pub fn new(descriptors: impl IntoIterator<Item = ModuleDescriptor>) -> Self {
        let source = Self::default();
        for d in descriptors {
            source.publish(d);
        }
        source
    }

    /// Add or replace a catalog entry.
    pub fn publish(&self, descriptor: ModuleDescriptor) {
        self.entries.insert(descriptor.id.clone(), descriptor);
    }
}

#[async_trait]
impl UpdateSource for StaticUpdateSource {
    async fn catalog(&self) -> Result<Vec<ModuleDescriptor>> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }

    async fn latest(&self, id: &str) -> Result<Option<ModuleDescriptor>> {
        Ok(self.entries.get(id).map(|e| e.value().clone()))
    }
}

/// A JSON catalog served over HTTP: either an array of descriptors or an
/// object with a `modules` array.
#[derive(Debug, Clone)]
pub struct HttpUpdateSource {
    client: reqwest::Client,
    url: Url,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogBody {
    List(Vec<ModuleDescriptor>),
    Wrapped { modules: Vec<ModuleDescriptor> },
}

impl HttpUpdateSource {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn catalog(&self) -> Result<Vec<ModuleDescriptor>> {
        let network = |e: reqwest::Error| {
            ModuleError::new(
                ErrorCode::NetworkError,
                format!("failed to fetch update catalog: {e}"),
            )
            .with_detail("url", self.url.as_str())
        };

        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(network)?;
        let body = response.bytes().await.map_err(network)?;

        let catalog: CatalogBody = serde_json::from_slice(&body).map_err(|e| {
            ModuleError::new(
                ErrorCode::CorruptionError,
                format!("update catalog is malformed: {e}"),
            )
            .with_detail("url", self.url.as_str())
        })?;
        let modules = match catalog {
            CatalogBody::List(modules) | CatalogBody::Wrapped { modules } => modules,
        };
        tracing::debug!(url = %self.url, entries = modules.len(), "fetched update catalog");
        Ok(modules)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent descriptor registry.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Arc<DashMap<String, ModuleDescriptor>>,
    updates: Option<Arc<dyn UpdateSource>>,
    events: Arc<OnceLock<EventBus>>,
}

impl ModuleRegistry {
    /// Create an empty registry with no update source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `source` for [`check_for_updates`](Self::check_for_updates) and
    /// [`update_module`](Self::update_module).
    #[must_use]
    pub fn with_update_source(mut self, source: impl UpdateSource) -> Self {
        self.updates = Some(Arc::new(source));
        self
    }

    /// Publish registry events on `bus`.  Only the first bus attached is
    /// used; the effective bus is returned.
    pub(crate) fn attach_events(&self, bus: EventBus) -> EventBus {
        self.events.get_or_init(|| bus).clone()
    }

    fn publish(&self, event: RuntimeEvent) {
        if let Some(bus) = self.events.get() {
            bus.publish(event);
        }
    }

    /// Insert or replace a descriptor.
    pub fn register_module(&self, descriptor: ModuleDescriptor) {
        let id = descriptor.id.clone();
        let version = descriptor.version.clone();
        if let Some(previous) = self.modules.insert(id.clone(), descriptor) {
            tracing::debug!(module_id = %id, previous = %previous.version, %version, "module re-registered");
        } else {
            tracing::info!(module_id = %id, %version, "module registered");
        }
        self.publish(RuntimeEvent::ModuleRegistered {
            module_id: id,
            version,
        });
    }

    /// Remove a descriptor.
    pub fn unregister_module(&self, id: &str) -> Result<ModuleDescriptor> {
        let (_, removed) = self.modules.remove(id).ok_or_else(|| not_found(id))?;
        tracing::info!(module_id = %id, "module unregistered");
        Ok(removed)
    }

    pub fn get_module(&self, id: &str) -> Option<ModuleDescriptor> {
        self.modules.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// All descriptors, sorted by id.
    pub fn list_modules(&self) -> Vec<ModuleDescriptor> {
        self.collect(|_| true)
    }

    /// Descriptors whose category matches, ignoring case.
    pub fn modules_by_category(&self, category: &str) -> Vec<ModuleDescriptor> {
        self.collect(|d| d.category.eq_ignore_ascii_case(category))
    }

    /// Case-insensitive substring search over id, name, category, tags and
    /// description.  An empty query matches everything.
    pub fn search_modules(&self, query: &str) -> Vec<ModuleDescriptor> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.list_modules();
        }
        self.collect(|d| d.matches(&needle))
    }

    fn collect(&self, keep: impl Fn(&ModuleDescriptor) -> bool) -> Vec<ModuleDescriptor> {
        let mut out: Vec<ModuleDescriptor> = self
            .modules
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Transitive dependencies of `id` in load order (dependencies first,
    /// `id` itself excluded).
    ///
    /// Fails with `LOAD_FAILED` when `id` or any dependency is unknown, or
    /// when the graph has a cycle.
    pub fn resolve_dependencies(&self, id: &str) -> Result<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            registry: &ModuleRegistry,
            id: &str,
            path: &mut Vec<String>,
            marks: &mut HashMap<String, Mark>,
            order: &mut Vec<String>,
        ) -> Result<()> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    path.push(id.to_owned());
                    return Err(ModuleError::load_failed(
                        id,
                        format!("dependency cycle: {}", path.join(" -> ")),
                    )
                    .with_detail("cycle", path.clone()));
                }
                None => {}
            }

            let descriptor = registry.get_module(id).ok_or_else(|| match path.last() {
                Some(dependent) => ModuleError::load_failed(
                    dependent,
                    format!("module '{dependent}' depends on unknown module '{id}'"),
                )
                .with_detail("missing_dependency", id),
                None => ModuleError::load_failed(id, format!("module '{id}' is not registered")),
            })?;

            marks.insert(id.to_owned(), Mark::Visiting);
            path.push(id.to_owned());
            for dep in &descriptor.dependencies {
                visit(registry, dep, path, marks, order)?;
            }
            path.pop();
            marks.insert(id.to_owned(), Mark::Done);
            order.push(id.to_owned());
            Ok(())
        }

        let mut order = Vec::new();
        visit(self, id, &mut Vec::new(), &mut HashMap::new(), &mut order)?;
        order.pop();
        Ok(order)
    }

    /// Registered modules for which the update source has a newer version.
    ///
    /// Empty when no update source is configured.
    pub async fn check_for_updates(&self) -> Result<Vec<ModuleUpdate>> {
        let Some(source) = &self.updates else {
            tracing::debug!("no update source configured, skipping update check");
            return Ok(Vec::new());
        };

        let mut updates: Vec<ModuleUpdate> = source
            .catalog()
            .await?
            .into_iter()
            .filter_map(|latest| {
                let current = self.get_module(&latest.id)?;
                (compare_versions(&latest.version, &current.version) == Ordering::Greater).then(
                    || ModuleUpdate {
                        id: latest.id,
                        current_version: current.version,
                        latest_version: latest.version,
                    },
                )
            })
            .collect();
        updates.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::info!(available = updates.len(), "update check finished");
        Ok(updates)
    }

    /// Replace `id`'s descriptor with the update source's latest one.
    pub async fn update_module(&self, id: &str) -> Result<ModuleDescriptor> {
        let current = self.get_module(id).ok_or_else(|| not_found(id))?;
        let source = self.updates.as_ref().ok_or_else(|| {
            not_found(id).with_suggestions(["Configure an update catalog to enable updates"])
        })?;
        let mut latest = source.latest(id).await?.ok_or_else(|| {
            ModuleError::new(
                ErrorCode::ModuleNotFound,
                format!("update source has no entry for module '{id}'"),
            )
            .with_detail("module_id", id)
        })?;
        latest.id = id.to_owned();

        self.modules.insert(id.to_owned(), latest.clone());
        tracing::info!(
            module_id = %id,
            from = %current.version,
            to = %latest.version,
            "module updated"
        );
        self.publish(RuntimeEvent::ModuleUpdated {
            module_id: id.to_owned(),
            from_version: current.version,
            to_version: latest.version.clone(),
        });
        Ok(latest)
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.len())
            .field("has_update_source", &self.updates.is_some())
            .finish()
    }
}

fn not_found(id: &str) -> ModuleError {
    ModuleError::new(
        ErrorCode::ModuleNotFound,
        format!("module '{id}' is not registered"),
    )
    .with_detail("module_id", id)
}
