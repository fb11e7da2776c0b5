//! Namespace-rewriting view over a cluster-wide watch

use crate::cache::{Object, ResourceLister, WatchEntry};
use crate::errors::Result;
use crate::selector::Selector;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Narrows a cluster-wide [`WatchEntry`] to one namespace without opening
/// another upstream subscription.
///
/// Reads are rewritten to the namespaced lister paths; lifecycle calls go
/// straight through to the shared entry.
#[derive(Debug)]
pub struct ScopedWatch {
    entry: Arc<WatchEntry>,
    namespace: String,
}

impl ScopedWatch {
    pub fn new(entry: Arc<WatchEntry>, namespace: &str) -> Self {
        ScopedWatch {
            entry,
            namespace: namespace.to_string(),
        }
    }
}

impl ResourceLister for ScopedWatch {
    fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.entry.resource().key())
    }

    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    fn list(&self, selector: &Selector) -> Result<Vec<Object>> {
        self.entry
            .lister()
            .list_namespaced(&self.namespace, selector)
    }

    fn get(&self, name: &str) -> Result<Object> {
        self.entry.lister().get_namespaced(&self.namespace, name)
    }

    fn drain(&self, events: mpsc::Sender<Object>, stop: CancellationToken) {
        self.entry.drain(events, stop);
    }

    fn stop(&self) {
        self.entry.stop();
    }

    fn running(&self) -> usize {
        self.entry.running()
    }
}
