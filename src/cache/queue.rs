//! Event work queue shared by drain pumps

use crate::cache::Object;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Key used for queue coalescing; re-adds of an in-flight key are merged.
pub trait QueueKey {
    fn queue_key(&self) -> String;
}

impl QueueKey for Object {
    fn queue_key(&self) -> String {
        match self.metadata.namespace.as_deref() {
            Some(ns) => format!(
                "{}/{}",
                ns,
                self.metadata.name.as_deref().unwrap_or_default()
            ),
            None => self.metadata.name.clone().unwrap_or_default(),
        }
    }
}

struct QueueState<T> {
    queue: VecDeque<T>,
    /// Keys currently sitting in the queue.
    queued: HashSet<String>,
    /// Keys handed to a consumer and not yet marked done.
    processing: HashSet<String>,
    /// Latest payload re-added while its key was processing.
    pending: HashMap<String, T>,
    shutting_down: bool,
}

/// Unbounded multi-producer multi-consumer FIFO with a shutdown gate.
///
/// Items are partitioned across consumers: `get` hands each item to
/// exactly one caller. Re-adds of a queued key are dropped and re-adds of
/// an in-flight key are parked until `done`, so bursts for one object
/// coalesce instead of piling up.
pub struct WorkQueue<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T: QueueKey> WorkQueue<T> {
    pub fn new(name: &str) -> Self {
        WorkQueue {
            name: name.to_string(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                pending: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends an item unless an equal key is already pending.
    pub fn add(&self, item: T) {
        let key = item.queue_key();
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(&key) {
            state.pending.insert(key, item);
            return;
        }
        if !state.queued.insert(key) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Takes the next item, waiting until one is available.
    ///
    /// Returns `(None, true)` once the queue is shut down and drained;
    /// remaining items are still handed out first.
    pub async fn get(&self) -> (Option<T>, bool) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            // register before checking so a notification arriving between
            // the check and the await is not lost
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    let key = item.queue_key();
                    state.queued.remove(&key);
                    state.processing.insert(key);
                    return (Some(item), false);
                }
                if state.shutting_down {
                    return (None, true);
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Marks an item complete, requeueing the payload that arrived while
    /// it was in flight, if any.
    pub fn done(&self, item: &T) {
        let key = item.queue_key();
        let mut state = self.lock();
        state.processing.remove(&key);
        if state.shutting_down {
            return;
        }
        if let Some(next) = state.pending.remove(&key) {
            state.queued.insert(key);
            state.queue.push_back(next);
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Closes the gate; pending items drain, then `get` reports shutdown.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        // nothing panics while holding the lock
        self.state.lock().expect("work queue lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    impl QueueKey for String {
        fn queue_key(&self) -> String {
            self.clone()
        }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let queue = WorkQueue::new("test");
        queue.add("a".to_string());
        queue.add("b".to_string());
        queue.add("c".to_string());

        assert_eq!(queue.get().await, (Some("a".to_string()), false));
        assert_eq!(queue.get().await, (Some("b".to_string()), false));
        assert_eq!(queue.get().await, (Some("c".to_string()), false));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn coalesces_queued_duplicates() {
        let queue = WorkQueue::new("test");
        queue.add("a".to_string());
        queue.add("a".to_string());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn readd_during_processing_parks_until_done() {
        let queue = WorkQueue::new("test");
        queue.add("a".to_string());

        let (item, _) = queue.get().await;
        let item = item.unwrap();
        queue.add("a".to_string());
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, (Some("a".to_string()), false));
    }

    #[tokio::test]
    async fn shutdown_drains_remaining_items() {
        let queue = WorkQueue::new("test");
        queue.add("shutdown".to_string());
        queue.shut_down();

        assert_eq!(queue.get().await, (Some("shutdown".to_string()), false));
        assert_eq!(queue.get().await, (None, true));
        // shutdown is sticky
        queue.add("late".to_string());
        assert_eq!(queue.get().await, (None, true));
    }

    #[tokio::test]
    async fn get_waits_for_an_item() {
        let queue = Arc::new(WorkQueue::new("test"));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add("a".to_string());

        let got = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("get did not wake up")
            .expect("get task panicked");
        assert_eq!(got, (Some("a".to_string()), false));
    }
}
