//! Two-level registry of live watches

use crate::cache::{CompositeWatch, ResourceLister, ScopedWatch, WatchEntry};
use crate::errors::{Error, Result};
use crate::resource::ResourceId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type EntryMap = Arc<RwLock<HashMap<String, Arc<WatchEntry>>>>;

/// Registry of every live watch, keyed by resource key and then by the
/// namespace-qualified entry key.
///
/// The registry owns entry lifecycles; views borrow entries and never
/// remove them. Stopped entries linger so enumeration can tell running
/// from stopped. A lock poisoned mid-update surfaces as
/// [`Error::Corrupted`] from lookups and inserts, while enumeration skips
/// the unreadable slot.
#[derive(Default)]
pub struct WatchRegistry {
    watches: RwLock<HashMap<String, EntryMap>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        WatchRegistry::default()
    }

    /// Stores an entry under its resource and entry keys.
    pub(crate) fn insert(&self, entry: Arc<WatchEntry>) -> Result<()> {
        let resource_key = entry.resource().key();
        let mut outer = self.watches.write().map_err(|_| Error::Corrupted {
            key: resource_key.clone(),
        })?;
        let entries = outer.entry(resource_key.clone()).or_default().clone();
        drop(outer);

        let mut entries = entries.write().map_err(|_| Error::Corrupted {
            key: resource_key,
        })?;
        entries.insert(entry.key(), entry);
        Ok(())
    }

    /// Resolves a resource to a composite view per the namespace matrix:
    /// no namespaces (or any cluster-wide sentinel) selects every entry;
    /// otherwise each requested namespace takes matching scoped entries
    /// directly and wraps cluster-wide entries into scoped views.
    pub fn lookup(&self, resource: &ResourceId, namespaces: &[&str]) -> Result<CompositeWatch> {
        let resource_key = resource.key();
        let not_found = || Error::WatchNotFound {
            resource: resource_key.clone(),
            namespaces: namespaces.iter().map(|ns| ns.to_string()).collect(),
        };

        let entries = {
            let outer = self.watches.read().map_err(|_| Error::Corrupted {
                key: resource_key.clone(),
            })?;
            outer.get(&resource_key).cloned().ok_or_else(not_found)?
        };
        let entries: Vec<Arc<WatchEntry>> = {
            let entries = entries.read().map_err(|_| Error::Corrupted {
                key: resource_key.clone(),
            })?;
            entries.values().cloned().collect()
        };

        let use_all = namespaces.is_empty() || namespaces.iter().any(|ns| ns.is_empty());
        let mut listers: Vec<Arc<dyn ResourceLister>> = Vec::new();
        if use_all {
            tracing::info!(resource = %resource_key, "using all namespaces");
            listers.extend(entries.into_iter().map(|e| e as Arc<dyn ResourceLister>));
        } else {
            for ns in namespaces {
                for entry in &entries {
                    if entry.namespace().is_empty() {
                        tracing::info!(
                            resource = %resource_key,
                            namespace = %ns,
                            "wrapping cluster-wide watch for namespace"
                        );
                        listers.push(Arc::new(ScopedWatch::new(entry.clone(), ns)));
                    } else if entry.namespace() == *ns {
                        tracing::info!(
                            resource = %resource_key,
                            namespace = %ns,
                            "found watch for namespace"
                        );
                        listers.push(entry.clone());
                    }
                }
            }
        }

        if listers.is_empty() {
            return Err(not_found());
        }
        Ok(CompositeWatch::new(listers))
    }

    /// Snapshot of entries, optionally only the running ones.
    pub fn list(&self, only_running: bool) -> Vec<Arc<WatchEntry>> {
        let mut out = Vec::new();
        let outer = match self.watches.read() {
            Ok(outer) => outer,
            Err(_) => return out,
        };
        for entries in outer.values() {
            let entries = match entries.read() {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.values() {
                if only_running && !entry.is_running() {
                    continue;
                }
                out.push(entry.clone());
            }
        }
        out
    }

    pub fn count(&self, only_running: bool) -> usize {
        self.list(only_running).len()
    }

    /// Stops every entry. Idempotent.
    pub fn stop_all(&self) {
        for entry in self.list(false) {
            entry.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pod_resource, FakeInformer};

    fn entry(ns: &str) -> Arc<WatchEntry> {
        let informer = Arc::new(FakeInformer::new());
        Arc::new(WatchEntry::new(pod_resource(), ns, informer, false))
    }

    #[test]
    fn lookup_unknown_resource_is_not_found() {
        let registry = WatchRegistry::new();
        let err = registry.lookup(&pod_resource(), &["ns1"]).unwrap_err();
        assert!(matches!(err, Error::WatchNotFound { .. }));
    }

    #[test]
    fn insert_then_lookup_by_namespace() {
        let registry = WatchRegistry::new();
        registry.insert(entry("ns1")).unwrap();

        let view = registry.lookup(&pod_resource(), &["ns1"]).unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view.key(), "ns1.v1.Pod");
    }

    #[test]
    fn reinserting_the_same_key_keeps_one_entry() {
        let registry = WatchRegistry::new();
        registry.insert(entry("ns1")).unwrap();
        registry.insert(entry("ns1")).unwrap();
        assert_eq!(registry.count(false), 1);
    }

    #[test]
    fn cluster_wide_entry_is_rewritten_for_each_namespace() {
        let registry = WatchRegistry::new();
        registry.insert(entry("")).unwrap();

        let view = registry.lookup(&pod_resource(), &["a", "b"]).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.key(), "a.v1.Pod,b.v1.Pod");
        assert_eq!(view.namespace(), "a,b");
    }

    #[test]
    fn sentinel_anywhere_selects_all_entries() {
        let registry = WatchRegistry::new();
        registry.insert(entry("")).unwrap();
        registry.insert(entry("ns1")).unwrap();

        let everything = registry.lookup(&pod_resource(), &[]).unwrap();
        assert_eq!(everything.len(), 2);

        let dominated = registry.lookup(&pod_resource(), &["a", ""]).unwrap();
        assert_eq!(dominated.len(), 2);
        assert_eq!(dominated.key(), everything.key());

        let lone_sentinel = registry.lookup(&pod_resource(), &[""]).unwrap();
        assert_eq!(lone_sentinel.len(), 2);
    }

    #[test]
    fn mismatched_namespaces_are_skipped() {
        let registry = WatchRegistry::new();
        registry.insert(entry("ns1")).unwrap();

        let err = registry.lookup(&pod_resource(), &["ns2"]).unwrap_err();
        assert!(matches!(err, Error::WatchNotFound { .. }));
    }

    #[test]
    fn stop_all_is_idempotent() {
        let registry = WatchRegistry::new();
        registry.insert(entry("ns1")).unwrap();
        registry.insert(entry("ns2")).unwrap();

        registry.stop_all();
        registry.stop_all();
        assert_eq!(registry.count(true), 0);
        assert_eq!(registry.count(false), 2);
    }

    #[test]
    fn poisoned_entries_surface_as_corrupted() {
        let registry = WatchRegistry::new();
        registry.insert(entry("ns1")).unwrap();

        let entries = registry
            .watches
            .read()
            .unwrap()
            .get("v1.Pod")
            .unwrap()
            .clone();
        let _ = std::thread::spawn(move || {
            let _guard = entries.write().unwrap();
            panic!("poison the entry map");
        })
        .join();

        let err = registry.lookup(&pod_resource(), &["ns1"]).unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
        assert_eq!(err.to_string(), "watch registry state for key v1.Pod is corrupted");

        // enumeration skips the unreadable slot instead of failing
        assert_eq!(registry.count(false), 0);
    }
}
