//! Discovered resource catalog

use crate::resource::ResourceId;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Scope class a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    Cluster,
    Namespaced,
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceScope::Cluster => f.write_str("cluster"),
            ResourceScope::Namespaced => f.write_str("namespaced"),
        }
    }
}

/// Concurrent map from scope class to the resources discovered under it.
///
/// Insertion order is preserved; duplicates are dropped by resource key.
#[derive(Default)]
pub struct ResourceCatalog {
    inner: RwLock<HashMap<ResourceScope, Vec<ResourceId>>>,
}

impl ResourceCatalog {
    pub fn new() -> Self {
        ResourceCatalog::default()
    }

    pub fn add(&self, scope: ResourceScope, resources: impl IntoIterator<Item = ResourceId>) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let existing = inner.entry(scope).or_default();
        for resource in resources {
            if !existing.iter().any(|r| r.key() == resource.key()) {
                existing.push(resource);
            }
        }
    }

    /// Snapshot of the resources under a scope class, empty when absent.
    pub fn get(&self, scope: ResourceScope) -> Vec<ResourceId> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&scope)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, scope: ResourceScope) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&scope)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.values().all(Vec::is_empty)
    }
}
