//! Fakes for the informer, reviewer and discovery seams
//!
//! Shipped as a public module so embedders can exercise their own wiring
//! without a cluster, the same way the library's tests do.

use crate::access::{AccessReviewer, ReviewDecision};
use crate::cache::Object;
use crate::discovery::ServerResources;
use crate::errors::{Error, Result, StreamError};
use crate::informer::{EventHandler, Informer, InformerFactory, Lister, WatchErrorHandler};
use crate::resource::ResourceId;
use crate::selector::Selector;
use async_trait::async_trait;
use kube::api::DynamicObject;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Factory handing out one shared fake informer for every resource.
#[derive(Default)]
pub struct FakeInformerFactory {
    informer: Arc<FakeInformer>,
}

impl FakeInformerFactory {
    pub fn new() -> Self {
        FakeInformerFactory::default()
    }

    pub fn informer(&self) -> Arc<FakeInformer> {
        self.informer.clone()
    }
}

impl InformerFactory for FakeInformerFactory {
    fn for_resource(&self, _resource: &ResourceId) -> Arc<dyn Informer> {
        self.informer.clone()
    }
}

/// Informer whose events and stream errors are fired by the test.
#[derive(Default)]
pub struct FakeInformer {
    lister: Arc<FakeLister>,
    handlers: Mutex<Vec<EventHandler>>,
    error_handler: Mutex<Option<WatchErrorHandler>>,
}

impl FakeInformer {
    pub fn new() -> Self {
        FakeInformer::default()
    }

    pub fn lister(&self) -> Arc<FakeLister> {
        self.lister.clone()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    pub fn fire_add(&self, obj: Object) {
        for handler in self.handlers.lock().unwrap().iter() {
            (handler.on_add)(obj.clone());
        }
    }

    pub fn fire_update(&self, old: Object, new: Object) {
        for handler in self.handlers.lock().unwrap().iter() {
            (handler.on_update)(old.clone(), new.clone());
        }
    }

    pub fn fire_delete(&self, obj: Object) {
        for handler in self.handlers.lock().unwrap().iter() {
            (handler.on_delete)(obj.clone());
        }
    }

    /// Invokes the installed watch error handler, as the reflector loop
    /// would on a stream failure.
    pub fn fire_stream_error(&self, err: &StreamError) {
        if let Some(handler) = self.error_handler.lock().unwrap().as_ref() {
            handler(err);
        }
    }
}

#[async_trait]
impl Informer for FakeInformer {
    fn add_event_handler(&self, handler: EventHandler) {
        self.handlers.lock().unwrap().push(handler);
    }

    fn set_watch_error_handler(&self, handler: WatchErrorHandler) {
        *self.error_handler.lock().unwrap() = Some(handler);
    }

    fn lister(&self) -> Arc<dyn Lister> {
        self.lister.clone()
    }

    fn has_synced(&self) -> bool {
        true
    }

    async fn run(&self, stop: CancellationToken) {
        stop.cancelled().await;
    }
}

/// In-memory lister with forceable failures.
#[derive(Default)]
pub struct FakeLister {
    objects: Mutex<Vec<Object>>,
    list_error: Mutex<Option<String>>,
    get_error: Mutex<Option<String>>,
}

impl FakeLister {
    pub fn new() -> Self {
        FakeLister::default()
    }

    pub fn set_objects(&self, objects: Vec<Object>) {
        *self.objects.lock().unwrap() = objects;
    }

    pub fn add_object(&self, object: Object) {
        self.objects.lock().unwrap().push(object);
    }

    pub fn fail_list(&self, message: &str) {
        *self.list_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_get(&self, message: &str) {
        *self.get_error.lock().unwrap() = Some(message.to_string());
    }

    fn list_failure(&self) -> Option<Error> {
        self.list_error.lock().unwrap().clone().map(Error::Lister)
    }

    fn get_failure(&self) -> Option<Error> {
        self.get_error.lock().unwrap().clone().map(Error::Lister)
    }
}

impl Lister for FakeLister {
    fn list(&self, selector: &Selector) -> Result<Vec<Object>> {
        if let Some(err) = self.list_failure() {
            return Err(err);
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|obj| selector.matches(obj.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    fn get(&self, name: &str) -> Result<Object> {
        if let Some(err) = self.get_failure() {
            return Err(err);
        }
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|obj| obj.metadata.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound {
                name: name.to_string(),
                namespaces: Vec::new(),
            })
    }

    fn list_namespaced(&self, namespace: &str, selector: &Selector) -> Result<Vec<Object>> {
        if let Some(err) = self.list_failure() {
            return Err(err);
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|obj| obj.metadata.namespace.as_deref() == Some(namespace))
            .filter(|obj| selector.matches(obj.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    fn get_namespaced(&self, namespace: &str, name: &str) -> Result<Object> {
        if let Some(err) = self.get_failure() {
            return Err(err);
        }
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|obj| {
                obj.metadata.namespace.as_deref() == Some(namespace)
                    && obj.metadata.name.as_deref() == Some(name)
            })
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound {
                name: name.to_string(),
                namespaces: vec![namespace.to_string()],
            })
    }
}

type ReviewFn = dyn Fn(&str, &ResourceId, &str) -> Result<ReviewDecision> + Send + Sync;

/// Access reviewer with a programmable decision function.
///
/// The default behavior mirrors an unreachable review endpoint.
pub struct FakeAccessReviewer {
    review_fn: Box<ReviewFn>,
}

impl Default for FakeAccessReviewer {
    fn default() -> Self {
        FakeAccessReviewer::failing()
    }
}

impl FakeAccessReviewer {
    pub fn with_fn(
        review_fn: impl Fn(&str, &ResourceId, &str) -> Result<ReviewDecision> + Send + Sync + 'static,
    ) -> Self {
        FakeAccessReviewer {
            review_fn: Box::new(review_fn),
        }
    }

    /// Every review succeeds with `allowed=true`.
    pub fn allowing() -> Self {
        FakeAccessReviewer::with_fn(|_, _, _| {
            Ok(ReviewDecision {
                allowed: true,
                ..Default::default()
            })
        })
    }

    /// Every review succeeds with `allowed=false`.
    pub fn denying() -> Self {
        FakeAccessReviewer::with_fn(|_, _, _| Ok(ReviewDecision::default()))
    }

    /// Every review fails at the transport.
    pub fn failing() -> Self {
        FakeAccessReviewer::with_fn(|_, _, _| Err(Error::Lister("default fake error".to_string())))
    }
}

#[async_trait]
impl AccessReviewer for FakeAccessReviewer {
    async fn review(
        &self,
        namespace: &str,
        resource: &ResourceId,
        verb: &str,
    ) -> Result<ReviewDecision> {
        (self.review_fn)(namespace, resource, verb)
    }
}

/// Discovery returning a fixed resource list, or a forced failure.
#[derive(Default)]
pub struct FakeServerResources {
    resources: Vec<ResourceId>,
    error: Option<String>,
}

impl FakeServerResources {
    pub fn new(resources: Vec<ResourceId>) -> Self {
        FakeServerResources {
            resources,
            error: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        FakeServerResources {
            resources: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl ServerResources for FakeServerResources {
    async fn preferred_resources(&self) -> Result<Vec<ResourceId>> {
        match &self.error {
            Some(message) => Err(Error::ResourceDiscovery {
                causes: vec![message.clone()],
            }),
            None => Ok(self.resources.clone()),
        }
    }

    async fn preferred_namespaced_resources(&self) -> Result<Vec<ResourceId>> {
        let mut resources = self.preferred_resources().await?;
        resources.retain(|r| r.namespaced);
        Ok(resources)
    }
}

/// Namespaced pods descriptor used across tests.
pub fn pod_resource() -> ResourceId {
    ResourceId::new("", "v1", "Pod", "pods").with_verbs(&["get", "list", "watch"])
}

/// Namespaced deployments descriptor used across tests.
pub fn deployment_resource() -> ResourceId {
    ResourceId::new("apps", "v1", "Deployment", "deployments")
        .with_verbs(&["get", "list", "watch", "delete", "create"])
}

/// Cluster-scoped nodes descriptor used across tests.
pub fn node_resource() -> ResourceId {
    ResourceId::new("", "v1", "Node", "nodes")
        .with_verbs(&["list", "watch"])
        .cluster_scoped()
}

/// A dynamic object in the given namespace; an empty namespace leaves the
/// object cluster-scoped.
pub fn test_object(namespace: &str, name: &str) -> Object {
    let mut obj = DynamicObject::new(name, &pod_resource().api_resource());
    if !namespace.is_empty() {
        obj = obj.within(namespace);
    }
    obj.data = serde_json::json!({ "spec": {} });
    Arc::new(obj)
}

/// A test object carrying labels, for selector coverage.
pub fn test_object_labeled(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Object {
    let mut obj = DynamicObject::new(name, &pod_resource().api_resource());
    if !namespace.is_empty() {
        obj = obj.within(namespace);
    }
    obj.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    Arc::new(obj)
}
