//! One live upstream subscription

use crate::cache::{Object, QueueKey, ResourceLister, WorkQueue};
use crate::errors::{Result, StreamError};
use crate::informer::{EventHandler, Informer, WatchErrorHandler};
use crate::resource::ResourceId;
use crate::selector::Selector;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// An informer bound to one resource type and one namespace, with an
/// optional event queue.
///
/// Entries are created by [`super::Watcher::watch`] and owned by the
/// registry; stopping is irreversible and a stopped entry stays in the
/// registry so callers can tell stopped from missing.
pub struct WatchEntry {
    resource: ResourceId,
    namespace: String,
    informer: Arc<dyn Informer>,
    lister: Arc<dyn crate::informer::Lister>,
    queue: Arc<WorkQueue<Object>>,
    stop: CancellationToken,
    queue_events: bool,
}

impl std::fmt::Debug for WatchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEntry")
            .field("resource", &self.resource)
            .field("namespace", &self.namespace)
            .field("stop", &self.stop)
            .field("queue_events", &self.queue_events)
            .finish()
    }
}

impl WatchEntry {
    pub fn new(
        resource: ResourceId,
        namespace: &str,
        informer: Arc<dyn Informer>,
        queue_events: bool,
    ) -> Self {
        let lister = informer.lister();
        let queue = Arc::new(WorkQueue::new(&resource.key()));
        WatchEntry {
            resource,
            namespace: namespace.to_string(),
            informer,
            lister,
            queue,
            stop: CancellationToken::new(),
            queue_events,
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn queue(&self) -> &Arc<WorkQueue<Object>> {
        &self.queue
    }

    pub(crate) fn lister(&self) -> &Arc<dyn crate::informer::Lister> {
        &self.lister
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn queues_events(&self) -> bool {
        self.queue_events
    }

    /// True until the initial listing has been applied upstream.
    pub fn has_synced(&self) -> bool {
        self.informer.has_synced()
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Handler that feeds the event queue: adds and updates enqueue the
    /// object, deletes complete it. Deletions are therefore not visible on
    /// the queue; consumers needing them consult the lister.
    pub(crate) fn event_handler(&self) -> EventHandler {
        let add_queue = self.queue.clone();
        let update_queue = self.queue.clone();
        let delete_queue = self.queue.clone();
        EventHandler {
            on_add: Box::new(move |obj| {
                tracing::debug!(object = %obj.queue_key(), "watch add");
                add_queue.add(obj);
            }),
            on_update: Box::new(move |_old, new| {
                tracing::debug!(object = %new.queue_key(), "watch update");
                update_queue.add(new);
            }),
            on_delete: Box::new(move |obj| {
                tracing::debug!(object = %obj.queue_key(), "watch delete");
                delete_queue.done(&obj);
            }),
        }
    }
}

impl ResourceLister for WatchEntry {
    fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.resource.key())
    }

    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    fn list(&self, selector: &Selector) -> Result<Vec<Object>> {
        if self.namespace.is_empty() {
            self.lister.list(selector)
        } else {
            self.lister.list_namespaced(&self.namespace, selector)
        }
    }

    fn get(&self, name: &str) -> Result<Object> {
        if self.namespace.is_empty() {
            self.lister.get(name)
        } else {
            self.lister.get_namespaced(&self.namespace, name)
        }
    }

    fn drain(&self, events: mpsc::Sender<Object>, stop: CancellationToken) {
        let queue = self.queue.clone();
        let watch_stop = self.stop.clone();
        let key = self.key();
        tokio::task::spawn(async move {
            loop {
                tokio::select! {
                    _ = watch_stop.cancelled() => {
                        tracing::debug!(key = %key, "watch stopped, ending drain");
                        return;
                    }
                    _ = stop.cancelled() => {
                        tracing::debug!(key = %key, "local stop closed, ending drain");
                        return;
                    }
                    (item, shutdown) = queue.get() => {
                        if shutdown {
                            tracing::debug!(key = %key, "queue shut down, ending drain");
                            if let Some(item) = item {
                                let _ = events.send(item).await;
                            }
                            return;
                        }
                        if let Some(item) = item {
                            if events.send(item).await.is_err() {
                                tracing::debug!(key = %key, "event channel closed, ending drain");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    fn stop(&self) {
        self.stop.cancel();
        self.queue.shut_down();
    }

    fn running(&self) -> usize {
        usize::from(self.is_running())
    }
}

/// Builds the stream error callback for an entry: terminal classes close
/// the watch, transient errors are left to the informer's own retry.
pub fn watch_error_handler(key: String, stop: CancellationToken) -> WatchErrorHandler {
    Box::new(move |err| match err {
        StreamError::Expired(_) => {
            tracing::error!(name = %key, error = %err, "watch closed");
            stop.cancel();
        }
        StreamError::Eof => {
            // watch closed normally
            stop.cancel();
        }
        StreamError::UnexpectedEof(_) => {
            tracing::error!(name = %key, error = %err, "watch closed with unexpected EOF");
            stop.cancel();
        }
        StreamError::Forbidden(_) => {
            tracing::error!(name = %key, error = %err, "watch closed with forbidden");
            stop.cancel();
        }
        StreamError::Transient(_) => {}
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pod_resource, test_object, FakeInformer};
    use std::time::Duration;
    use tokio::time::timeout;

    fn entry(namespace: &str) -> (WatchEntry, Arc<FakeInformer>) {
        let informer = Arc::new(FakeInformer::new());
        let entry = WatchEntry::new(pod_resource(), namespace, informer.clone(), true);
        (entry, informer)
    }

    #[test]
    fn key_is_namespace_prefixed() {
        let (scoped, _) = entry("ns1");
        assert_eq!(scoped.key(), "ns1.v1.Pod");

        let (cluster, _) = entry("");
        assert_eq!(cluster.key(), ".v1.Pod");
    }

    #[test]
    fn running_is_monotone() {
        let (entry, _) = entry("ns1");
        assert!(entry.is_running());
        entry.stop();
        assert!(!entry.is_running());
        entry.stop();
        assert!(!entry.is_running());
        assert_eq!(entry.running(), 0);
    }

    #[test]
    fn list_and_get_use_the_namespaced_path() {
        let (entry, informer) = entry("ns1");
        informer.lister().set_objects(vec![
            test_object("ns1", "a"),
            test_object("ns2", "b"),
        ]);

        let objs = entry.list(&Selector::everything()).unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].metadata.name.as_deref(), Some("a"));

        assert!(entry.get("a").is_ok());
        assert!(entry.get("b").is_err());
    }

    #[test]
    fn cluster_wide_entry_lists_everything() {
        let (entry, informer) = entry("");
        informer.lister().set_objects(vec![
            test_object("ns1", "a"),
            test_object("ns2", "b"),
        ]);
        assert_eq!(entry.list(&Selector::everything()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn drain_forwards_queued_events() {
        let (entry, _) = entry("ns1");
        let (tx, mut rx) = mpsc::channel(4);
        entry.drain(tx, CancellationToken::new());

        entry.queue().add(test_object("ns1", "a"));
        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no event")
            .expect("channel closed");
        assert_eq!(got.metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn drain_ends_on_watch_stop() {
        let (entry, _) = entry("ns1");
        let (tx, mut rx) = mpsc::channel(4);
        entry.drain(tx, CancellationToken::new());

        entry.stop();
        let closed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("drain did not end");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn drain_ends_on_local_stop() {
        let (entry, _) = entry("ns1");
        let (tx, mut rx) = mpsc::channel(4);
        let local = CancellationToken::new();
        entry.drain(tx, local.clone());

        local.cancel();
        let closed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("drain did not end");
        assert!(closed.is_none());
        // only the pump ended, the watch is untouched
        assert!(entry.is_running());
    }

    #[tokio::test]
    async fn drain_delivers_backlog_across_shutdown() {
        let (entry, _) = entry("ns1");
        entry.queue().add(test_object("ns1", "a"));
        entry.queue().shut_down();

        let (tx, mut rx) = mpsc::channel(4);
        entry.drain(tx, CancellationToken::new());

        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no event")
            .expect("channel closed");
        assert_eq!(got.metadata.name.as_deref(), Some("a"));
        let closed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("drain did not end");
        assert!(closed.is_none());
    }

    #[test]
    fn error_handler_stops_the_watch_on_terminal_classes() {
        for err in [
            StreamError::Expired("410".to_string()),
            StreamError::Eof,
            StreamError::UnexpectedEof("cut".to_string()),
            StreamError::Forbidden("403".to_string()),
        ] {
            let (entry, _) = entry("ns1");
            let handler = watch_error_handler(entry.key(), entry.stop_token());
            assert!(entry.is_running());
            handler(&err);
            assert!(!entry.is_running(), "{err} should stop the watch");
        }
    }

    #[test]
    fn error_handler_ignores_transient_errors() {
        let (entry, _) = entry("ns1");
        let handler = watch_error_handler(entry.key(), entry.stop_token());
        handler(&StreamError::Transient("dial timeout".to_string()));
        assert!(entry.is_running());
    }

    #[tokio::test]
    async fn event_handler_feeds_the_queue() {
        let (entry, _) = entry("ns1");
        let handler = entry.event_handler();

        (handler.on_add)(test_object("ns1", "a"));
        (handler.on_update)(test_object("ns1", "a"), test_object("ns1", "b"));
        assert_eq!(entry.queue().len(), 2);

        // deletes complete instead of enqueueing
        let (item, _) = entry.queue().get().await;
        (handler.on_delete)(item.unwrap());
        assert_eq!(entry.queue().len(), 1);
    }
}
