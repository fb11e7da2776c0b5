//! Informer and lister seam over the kube runtime
//!
//! The watch core only sees the traits below; the default implementation
//! mirrors a dynamic shared informer by feeding a reflector store from a
//! watcher stream and fanning events out to registered handlers.

use crate::cache::Object;
use crate::errors::{Error, Result, StreamError};
use crate::resource::ResourceId;
use crate::selector::Selector;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Callbacks invoked as the informer's cache changes.
pub struct EventHandler {
    pub on_add: Box<dyn Fn(Object) + Send + Sync>,
    pub on_update: Box<dyn Fn(Object, Object) + Send + Sync>,
    pub on_delete: Box<dyn Fn(Object) + Send + Sync>,
}

/// Callback invoked with classified watch stream failures.
pub type WatchErrorHandler = Box<dyn Fn(&StreamError) + Send + Sync>;

/// Read-side projection of an informer's cache.
pub trait Lister: Send + Sync {
    fn list(&self, selector: &Selector) -> Result<Vec<Object>>;
    fn get(&self, name: &str) -> Result<Object>;
    fn list_namespaced(&self, namespace: &str, selector: &Selector) -> Result<Vec<Object>>;
    fn get_namespaced(&self, namespace: &str, name: &str) -> Result<Object>;
}

/// One long-lived list+watch mirror of a resource type.
#[async_trait]
pub trait Informer: Send + Sync {
    /// Registers change callbacks. Handlers added after `run` still see
    /// subsequent events.
    fn add_event_handler(&self, handler: EventHandler);

    /// Installs the stream failure callback.
    fn set_watch_error_handler(&self, handler: WatchErrorHandler);

    /// Read access to the cache.
    fn lister(&self) -> Arc<dyn Lister>;

    /// True once the initial listing has been applied.
    fn has_synced(&self) -> bool;

    /// Runs the watch loop until `stop` fires.
    async fn run(&self, stop: CancellationToken);
}

/// Builds informers for arbitrary resource types.
pub trait InformerFactory: Send + Sync {
    fn for_resource(&self, resource: &ResourceId) -> Arc<dyn Informer>;
}

/// Informer factory backed by the dynamic API, optionally restricted to a
/// single namespace.
pub struct DynamicInformerFactory {
    client: kube::Client,
    resync: Duration,
    namespace: Option<String>,
}

impl DynamicInformerFactory {
    /// Cluster-wide factory.
    pub fn new(client: kube::Client, resync: Duration) -> Self {
        DynamicInformerFactory {
            client,
            resync,
            namespace: None,
        }
    }

    /// Factory serving a single namespace.
    pub fn filtered(client: kube::Client, resync: Duration, namespace: &str) -> Self {
        DynamicInformerFactory {
            client,
            resync,
            namespace: Some(namespace.to_string()),
        }
    }
}

impl InformerFactory for DynamicInformerFactory {
    fn for_resource(&self, resource: &ResourceId) -> Arc<dyn Informer> {
        let ar = resource.api_resource();
        let api: Api<DynamicObject> = match &self.namespace {
            Some(ns) if resource.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Arc::new(DynamicInformer::new(api, ar, self.resync))
    }
}

/// Reflector-store informer over a dynamic API.
pub struct DynamicInformer {
    api: Api<DynamicObject>,
    dyntype: ApiResource,
    writer: Mutex<Writer<DynamicObject>>,
    store: Store<DynamicObject>,
    handlers: Mutex<Vec<EventHandler>>,
    error_handler: Mutex<Option<WatchErrorHandler>>,
    synced: AtomicBool,
    resync: Duration,
}

impl DynamicInformer {
    pub fn new(api: Api<DynamicObject>, dyntype: ApiResource, resync: Duration) -> Self {
        let writer = Writer::new(dyntype.clone());
        let store = writer.as_reader();
        DynamicInformer {
            api,
            dyntype,
            writer: Mutex::new(writer),
            store,
            handlers: Mutex::new(Vec::new()),
            error_handler: Mutex::new(None),
            synced: AtomicBool::new(false),
            resync,
        }
    }

    fn cached(&self, obj: &DynamicObject) -> Option<Object> {
        let name = obj.metadata.name.as_deref()?;
        let mut obj_ref = ObjectRef::new_with(name, self.dyntype.clone());
        if let Some(ns) = obj.metadata.namespace.as_deref() {
            obj_ref = obj_ref.within(ns);
        }
        self.store.get(&obj_ref)
    }

    fn apply(&self, event: Event<DynamicObject>) {
        // deliver to the cache first, then notify handlers
        let previous = match &event {
            Event::Applied(obj) => self.cached(obj),
            _ => None,
        };
        self.writer
            .lock()
            .expect("reflector writer lock poisoned")
            .apply_watcher_event(&event);

        let handlers = self.handlers.lock().expect("handler list lock poisoned");
        match event {
            Event::Applied(obj) => {
                let obj = Arc::new(obj);
                match previous {
                    Some(old) => {
                        for handler in handlers.iter() {
                            (handler.on_update)(old.clone(), obj.clone());
                        }
                    }
                    None => {
                        for handler in handlers.iter() {
                            (handler.on_add)(obj.clone());
                        }
                    }
                }
            }
            Event::Deleted(obj) => {
                let obj = Arc::new(obj);
                for handler in handlers.iter() {
                    (handler.on_delete)(obj.clone());
                }
            }
            Event::Restarted(objs) => {
                self.synced.store(true, Ordering::SeqCst);
                for obj in objs {
                    let obj = Arc::new(obj);
                    for handler in handlers.iter() {
                        (handler.on_add)(obj.clone());
                    }
                }
            }
        }
    }

    fn report_stream_error(&self, err: &watcher::Error) {
        let class = StreamError::classify(err);
        tracing::warn!(error = %err, class = ?class, "watch stream error");
        let handler = self.error_handler.lock().expect("error handler lock poisoned");
        if let Some(handler) = handler.as_ref() {
            handler(&class);
        }
    }
}

#[async_trait]
impl Informer for DynamicInformer {
    fn add_event_handler(&self, handler: EventHandler) {
        self.handlers
            .lock()
            .expect("handler list lock poisoned")
            .push(handler);
    }

    fn set_watch_error_handler(&self, handler: WatchErrorHandler) {
        *self
            .error_handler
            .lock()
            .expect("error handler lock poisoned") = Some(handler);
    }

    fn lister(&self) -> Arc<dyn Lister> {
        Arc::new(StoreLister {
            store: self.store.clone(),
        })
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    async fn run(&self, stop: CancellationToken) {
        loop {
            let stream = watcher::watcher(self.api.clone(), watcher::Config::default());
            futures::pin_mut!(stream);
            let resync_timer = tokio::time::sleep(self.resync);
            tokio::pin!(resync_timer);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = &mut resync_timer => {
                        tracing::debug!("resync interval reached, restarting watch");
                        break;
                    }
                    maybe_event = stream.next() => match maybe_event {
                        Some(Ok(event)) => self.apply(event),
                        Some(Err(err)) => self.report_stream_error(&err),
                        None => {
                            tracing::warn!("watch stream ended");
                            break;
                        }
                    }
                }
            }

            if stop.is_cancelled() {
                return;
            }
        }
    }
}

/// Lister over a reflector store.
struct StoreLister {
    store: Store<DynamicObject>,
}

impl Lister for StoreLister {
    fn list(&self, selector: &Selector) -> Result<Vec<Object>> {
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|obj| selector.matches(obj.metadata.labels.as_ref()))
            .collect())
    }

    fn get(&self, name: &str) -> Result<Object> {
        self.store
            .state()
            .into_iter()
            .find(|obj| obj.metadata.name.as_deref() == Some(name))
            .ok_or_else(|| Error::ObjectNotFound {
                name: name.to_string(),
                namespaces: Vec::new(),
            })
    }

    fn list_namespaced(&self, namespace: &str, selector: &Selector) -> Result<Vec<Object>> {
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|obj| obj.metadata.namespace.as_deref() == Some(namespace))
            .filter(|obj| selector.matches(obj.metadata.labels.as_ref()))
            .collect())
    }

    fn get_namespaced(&self, namespace: &str, name: &str) -> Result<Object> {
        self.store
            .state()
            .into_iter()
            .find(|obj| {
                obj.metadata.namespace.as_deref() == Some(namespace)
                    && obj.metadata.name.as_deref() == Some(name)
            })
            .ok_or_else(|| Error::ObjectNotFound {
                name: name.to_string(),
                namespaces: vec![namespace.to_string()],
            })
    }
}
