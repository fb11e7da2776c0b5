//! Watch registry and lister core

mod catalog;
mod composite;
mod entry;
mod queue;
mod registry;
mod scoped;
mod watcher;

pub use catalog::{ResourceCatalog, ResourceScope};
pub use composite::CompositeWatch;
pub use entry::{watch_error_handler, WatchEntry};
pub use queue::{QueueKey, WorkQueue};
pub use registry::WatchRegistry;
pub use scoped::ScopedWatch;
pub use watcher::{Watcher, WatcherBuilder, DEFAULT_RESYNC};

use crate::errors::Result;
use crate::selector::Selector;
use kube::api::DynamicObject;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Object payload flowing through caches, queues and drain channels.
pub type Object = Arc<DynamicObject>;

/// Read and lifecycle surface shared by watch entries and their views.
///
/// Implemented by [`WatchEntry`] (one upstream subscription),
/// [`ScopedWatch`] (a namespace rewrite of a cluster-wide entry) and
/// [`CompositeWatch`] (a union of either).
pub trait ResourceLister: Send + Sync + std::fmt::Debug {
    /// Namespace-qualified identity of the watch.
    fn key(&self) -> String;

    /// Namespace served by this lister; empty means all namespaces.
    fn namespace(&self) -> String;

    /// All cached objects matching the selector.
    fn list(&self, selector: &Selector) -> Result<Vec<Object>>;

    /// Cached object by name.
    fn get(&self, name: &str) -> Result<Object>;

    /// Pumps queued events into `events` until the watch stops, `stop`
    /// fires, or the queue shuts down.
    fn drain(&self, events: mpsc::Sender<Object>, stop: CancellationToken);

    /// Stops the underlying watches. Idempotent.
    fn stop(&self);

    /// Number of underlying watches still running.
    fn running(&self) -> usize;
}

pub(crate) fn unique_join(values: impl IntoIterator<Item = String>) -> String {
    let mut seen = Vec::new();
    for value in values {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen.join(",")
}
