//! Watch construction and wiring

use crate::cache::{
    watch_error_handler, CompositeWatch, ResourceLister, WatchEntry, WatchRegistry,
};
use crate::errors::{Error, Result};
use crate::informer::{DynamicInformerFactory, InformerFactory};
use crate::resource::ResourceId;
use std::sync::Arc;
use std::time::Duration;

/// Informer refresh cadence used when none is configured.
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(180);

/// Creates watch entries and guarantees at most one upstream subscription
/// per resource and namespace.
///
/// Build with [`Watcher::builder`]; at least a client or an informer
/// factory must be configured.
pub struct Watcher {
    client: Option<kube::Client>,
    factory: Option<Arc<dyn InformerFactory>>,
    namespace: Option<String>,
    resync: Duration,
    registry: Arc<WatchRegistry>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("namespace", &self.namespace)
            .field("resync", &self.resync)
            .finish()
    }
}

#[derive(Default)]
pub struct WatcherBuilder {
    client: Option<kube::Client>,
    factory: Option<Arc<dyn InformerFactory>>,
    namespace: Option<String>,
    resync: Option<Duration>,
    registry: Option<Arc<WatchRegistry>>,
}

impl WatcherBuilder {
    pub fn new() -> Self {
        WatcherBuilder::default()
    }

    /// Transport handle used to build default informer factories.
    pub fn client(mut self, client: kube::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Overrides the informer factory; reused as-is for every watch.
    pub fn informer_factory(mut self, factory: Arc<dyn InformerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Constrains the watcher to a single namespace.
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn resync(mut self, resync: Duration) -> Self {
        self.resync = Some(resync);
        self
    }

    /// Shares an existing registry instead of starting an empty one.
    pub fn registry(mut self, registry: Arc<WatchRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Watcher> {
        if self.client.is_none() && self.factory.is_none() {
            return Err(Error::MissingClient);
        }
        Ok(Watcher {
            client: self.client,
            factory: self.factory,
            namespace: self.namespace.filter(|ns| !ns.is_empty()),
            resync: self.resync.unwrap_or(DEFAULT_RESYNC),
            registry: self.registry.unwrap_or_default(),
        })
    }
}

impl Watcher {
    pub fn builder() -> WatcherBuilder {
        WatcherBuilder::new()
    }

    pub fn registry(&self) -> Arc<WatchRegistry> {
        self.registry.clone()
    }

    /// Starts (or reuses) a watch for the resource in the given namespace,
    /// returning a view over it.
    ///
    /// When an entry already satisfies the request, the existing view is
    /// returned and nothing new is subscribed. When `queue_events` is set,
    /// change events accumulate on the entry's queue for `drain`.
    pub fn watch(
        &self,
        namespace: &str,
        resource: &ResourceId,
        queue_events: bool,
    ) -> Result<Arc<dyn ResourceLister>> {
        if let Some(configured) = &self.namespace {
            if namespace != configured {
                return Err(Error::NamespaceMismatch {
                    requested: namespace.to_string(),
                    configured: configured.clone(),
                });
            }
        }

        if let Ok(existing) = self.registry.lookup(resource, &[namespace]) {
            return Ok(Arc::new(existing));
        }

        let factory = self.informer_factory(namespace)?;
        let informer = factory.for_resource(resource);
        let entry = Arc::new(WatchEntry::new(
            resource.clone(),
            namespace,
            informer.clone(),
            queue_events,
        ));

        if queue_events {
            informer.add_event_handler(entry.event_handler());
        }
        informer.set_watch_error_handler(watch_error_handler(entry.key(), entry.stop_token()));

        let stop = entry.stop_token();
        let key = entry.key();
        let runner = informer.clone();
        tokio::task::spawn(async move {
            tracing::debug!(key = %key, "starting informer");
            runner.run(stop).await;
            tracing::debug!(key = %key, "informer finished");
        });

        self.registry.insert(entry.clone())?;
        Ok(entry)
    }

    /// Resolves existing watches for the resource; see
    /// [`WatchRegistry::lookup`] for the namespace matrix.
    pub fn lookup(&self, resource: &ResourceId, namespaces: &[&str]) -> Result<CompositeWatch> {
        self.registry.lookup(resource, namespaces)
    }

    pub fn list(&self, only_running: bool) -> Vec<Arc<WatchEntry>> {
        self.registry.list(only_running)
    }

    pub fn count(&self, only_running: bool) -> usize {
        self.registry.count(only_running)
    }

    /// Stops every watch this watcher's registry knows about.
    pub fn stop_all(&self) {
        self.registry.stop_all();
    }

    fn informer_factory(&self, namespace: &str) -> Result<Arc<dyn InformerFactory>> {
        if let Some(factory) = &self.factory {
            return Ok(factory.clone());
        }
        let client = self.client.clone().ok_or(Error::MissingClient)?;
        let factory: Arc<dyn InformerFactory> = if namespace.is_empty() {
            Arc::new(DynamicInformerFactory::new(client, self.resync))
        } else {
            Arc::new(DynamicInformerFactory::filtered(client, self.resync, namespace))
        };
        Ok(factory)
    }
}
