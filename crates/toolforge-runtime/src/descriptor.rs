//! Module descriptors.
//!
//! A [`ModuleDescriptor`] is the registry's immutable record of a known
//! module: identity, version, grouping, dependencies, and where its code
//! comes from.  Descriptors are replaced wholesale on update, never mutated.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::builtin::BuiltinKind;

/// Where a module's implementation comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleSource {
    /// One of the modules compiled into the host.
    Builtin {
        kind: BuiltinKind,
    },
    /// A compiled `.wasm` artifact at a `file://` or `http(s)://` location.
    Wasm {
        location: String,
    },
}

/// Registry record describing a known module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique identifier (e.g. `"json-formatter"`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Semantic version string.
    pub version: String,
    /// Grouping tag used by category listing and search.
    pub category: String,
    /// Ids of modules that must be loaded before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hex SHA-256 digest of the artifact, when the module has one.
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Extra search keywords.
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: ModuleSource,
}

impl ModuleDescriptor {
    /// Create a descriptor with the required fields; the rest default to empty.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        category: impl Into<String>,
        source: ModuleSource,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            category: category.into(),
            dependencies: Vec::new(),
            checksum: None,
            description: String::new(),
            tags: Vec::new(),
            source,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Case-insensitive substring match over id, name, category, tags and
    /// description.  `needle` must already be lowercase.
    pub(crate) fn matches(&self, needle: &str) -> bool {
        let hit = |s: &str| s.to_lowercase().contains(needle);
        hit(&self.id)
            || hit(&self.name)
            || hit(&self.category)
            || hit(&self.description)
            || self.tags.iter().any(|t| hit(t))
    }
}

/// An available version bump reported by [`check_for_updates`](crate::registry::ModuleRegistry::check_for_updates).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleUpdate {
    pub id: String,
    pub current_version: String,
    pub latest_version: String,
}

/// Compare two version strings numerically, component by component.
///
/// `"1.10.0"` sorts after `"1.9.3"`.  A leading `v` and any pre-release or
/// build suffix (`-beta`, `+abc`) are ignored for the numeric part; when the
/// numeric parts tie, a version with a pre-release suffix sorts first.
/// Non-numeric components fall back to string comparison.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn split(v: &str) -> (&str, bool) {
        let v = v.trim().trim_start_matches('v');
        let v = v.split('+').next().unwrap_or(v);
        match v.split_once('-') {
            Some((core, _)) => (core, true),
            None => (v, false),
        }
    }

    let (core_a, pre_a) = split(a);
    let (core_b, pre_b) = split(b);
    let mut parts_a = core_a.split('.');
    let mut parts_b = core_b.split('.');

    loop {
        match (parts_a.next(), parts_b.next()) {
            (None, None) => break,
            (x, y) => {
                let x = x.unwrap_or("0");
                let y = y.unwrap_or("0");
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }

    // 1.0.0-beta < 1.0.0
    match (pre_a, pre_b) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
