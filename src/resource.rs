//! Resource type identity

use kube::core::{ApiResource, GroupVersionKind};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a watchable resource type.
///
/// Carries no namespace; namespaces are bound when a watch is created.
#[derive(Debug, Clone)]
pub struct ResourceId {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural name used on the wire, e.g. `pods`.
    pub plural: String,
    /// Verbs the server advertises for this resource.
    pub verbs: BTreeSet<String>,
    /// False for cluster-scoped resources.
    pub namespaced: bool,
}

impl ResourceId {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        ResourceId {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            verbs: BTreeSet::new(),
            namespaced: true,
        }
    }

    pub fn with_verbs(mut self, verbs: &[&str]) -> Self {
        self.verbs = verbs.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }

    /// Canonical key: `group.version.Kind`, without the leading dot when
    /// the group is empty.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}.{}", self.version, self.kind)
        } else {
            format!("{}.{}.{}", self.group, self.version, self.kind)
        }
    }

    pub fn supports_verb(&self, verb: &str) -> bool {
        self.verbs.contains(verb)
    }

    pub fn group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    /// Dynamic type descriptor for the informer machinery.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.group_version_kind(), &self.plural)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// Identity is the canonical key; verb sets and plural names do not
// participate so rediscovered descriptors dedup cleanly.
impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Splits a flat discovery result into cluster-scoped and namespaced lists.
pub fn partition_by_scope(resources: Vec<ResourceId>) -> (Vec<ResourceId>, Vec<ResourceId>) {
    let mut cluster = Vec::new();
    let mut namespaced = Vec::new();
    for resource in resources {
        if resource.namespaced {
            namespaced.push(resource);
        } else {
            cluster.push(resource);
        }
    }
    (cluster, namespaced)
}
