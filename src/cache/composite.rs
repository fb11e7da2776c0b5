//! Union view over several watches

use crate::cache::{unique_join, Object, ResourceLister};
use crate::errors::{Error, ListerFailure, Result};
use crate::selector::Selector;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Presents several watches (entries or scoped views) as one lister.
///
/// Reads union across children; `drain` fans every child's events into the
/// same channel; lifecycle calls touch every child.
pub struct CompositeWatch {
    listers: Vec<Arc<dyn ResourceLister>>,
}

impl std::fmt::Debug for CompositeWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeWatch")
            .field("listers", &self.listers.len())
            .finish()
    }
}

impl CompositeWatch {
    pub fn new(listers: Vec<Arc<dyn ResourceLister>>) -> Self {
        CompositeWatch { listers }
    }

    pub fn len(&self) -> usize {
        self.listers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listers.is_empty()
    }

    pub fn children(&self) -> &[Arc<dyn ResourceLister>] {
        &self.listers
    }
}

impl ResourceLister for CompositeWatch {
    fn key(&self) -> String {
        unique_join(self.listers.iter().map(|l| l.key()))
    }

    fn namespace(&self) -> String {
        unique_join(self.listers.iter().map(|l| l.namespace()))
    }

    /// Union of the children's lists. A failed child is logged and
    /// skipped; if any failed, the union is returned inside a
    /// [`Error::PartialList`] naming every failure.
    fn list(&self, selector: &Selector) -> Result<Vec<Object>> {
        let mut objects = Vec::new();
        let mut failures = Vec::new();
        for lister in &self.listers {
            match lister.list(selector) {
                Ok(listed) => objects.extend(listed),
                Err(err) => {
                    tracing::error!(
                        resource = %lister.key(),
                        namespace = %lister.namespace(),
                        error = %err,
                        "failed to list"
                    );
                    failures.push(ListerFailure {
                        key: lister.key(),
                        namespace: lister.namespace(),
                        cause: err.to_string(),
                    });
                }
            }
        }
        if failures.is_empty() {
            Ok(objects)
        } else {
            Err(Error::PartialList {
                partial: objects,
                failures,
            })
        }
    }

    /// First successful get; an error names every child's namespace.
    fn get(&self, name: &str) -> Result<Object> {
        let mut searched = Vec::new();
        for lister in &self.listers {
            match lister.get(name) {
                Ok(obj) => return Ok(obj),
                Err(_) => searched.push(lister.namespace()),
            }
        }
        Err(Error::ObjectNotFound {
            name: name.to_string(),
            namespaces: searched,
        })
    }

    fn drain(&self, events: mpsc::Sender<Object>, stop: CancellationToken) {
        for lister in &self.listers {
            lister.drain(events.clone(), stop.clone());
        }
    }

    fn stop(&self) {
        for lister in &self.listers {
            lister.stop();
        }
    }

    fn running(&self) -> usize {
        self.listers.iter().map(|l| l.running()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WatchEntry;
    use crate::testing::{deployment_resource, pod_resource, test_object, FakeInformer};
    use std::time::Duration;
    use tokio::time::timeout;

    fn entry(resource: crate::resource::ResourceId, ns: &str) -> (Arc<WatchEntry>, Arc<FakeInformer>) {
        let informer = Arc::new(FakeInformer::new());
        let entry = Arc::new(WatchEntry::new(resource, ns, informer.clone(), true));
        (entry, informer)
    }

    #[test]
    fn key_and_namespace_join_unique_child_values() {
        let (pods, _) = entry(pod_resource(), "default");
        let (deployments, _) = entry(deployment_resource(), "different-ns");
        let wrapped = CompositeWatch::new(vec![pods, deployments]);

        assert_eq!(wrapped.key(), "default.v1.Pod,different-ns.apps.v1.Deployment");
        assert_eq!(wrapped.namespace(), "default,different-ns");
    }

    #[test]
    fn join_dedups_preserving_order() {
        assert_eq!(
            unique_join(["k1", "k2", "k2", "k3"].map(String::from)),
            "k1,k2,k3"
        );
    }

    #[test]
    fn list_unions_children() {
        let (pods, pods_informer) = entry(pod_resource(), "default");
        let (deployments, deploy_informer) = entry(deployment_resource(), "different-ns");
        pods_informer.lister().set_objects(vec![test_object("default", "p")]);
        deploy_informer
            .lister()
            .set_objects(vec![test_object("different-ns", "d")]);

        let wrapped = CompositeWatch::new(vec![pods, deployments]);
        let objs = wrapped.list(&Selector::everything()).unwrap();
        assert_eq!(objs.len(), 2);
    }

    #[test]
    fn list_reports_failed_children_with_the_partial_union() {
        let (pods, pods_informer) = entry(pod_resource(), "default");
        let (deployments, deploy_informer) = entry(deployment_resource(), "different-ns");
        pods_informer.lister().set_objects(vec![test_object("default", "p")]);
        deploy_informer.lister().fail_list("test lister error");

        let wrapped = CompositeWatch::new(vec![pods, deployments]);
        match wrapped.list(&Selector::everything()) {
            Err(Error::PartialList { partial, failures }) => {
                assert_eq!(partial.len(), 1);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].namespace, "different-ns");
                assert_eq!(failures[0].cause, "test lister error");
            }
            other => panic!("expected PartialList, got {other:?}"),
        }
    }

    #[test]
    fn get_returns_first_success_or_names_all_namespaces() {
        let (pods, pods_informer) = entry(pod_resource(), "default");
        let (deployments, deploy_informer) = entry(deployment_resource(), "different-ns");
        pods_informer.lister().set_objects(vec![test_object("default", "test-obj")]);
        deploy_informer.lister().set_objects(Vec::new());

        let wrapped = CompositeWatch::new(vec![pods, deployments]);
        assert!(wrapped.get("test-obj").is_ok());

        let err = wrapped.get("missing").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to find object missing in any namespace of: [\"default\", \"different-ns\"]"
        );
    }

    #[test]
    fn stop_stops_every_child() {
        let (pods, _) = entry(pod_resource(), "default");
        let (deployments, _) = entry(deployment_resource(), "different-ns");
        let wrapped = CompositeWatch::new(vec![pods.clone(), deployments.clone()]);

        assert_eq!(wrapped.running(), 2);
        wrapped.stop();
        assert_eq!(wrapped.running(), 0);
        assert!(!pods.is_running());
        assert!(!deployments.is_running());
    }

    #[tokio::test]
    async fn drain_fans_children_into_one_channel() {
        let (pods, _) = entry(pod_resource(), "ns1");
        let (deployments, _) = entry(deployment_resource(), "ns2");
        pods.queue().add(test_object("ns1", "e1"));
        deployments.queue().add(test_object("ns2", "e2"));

        let wrapped = CompositeWatch::new(vec![pods, deployments]);
        let (tx, mut rx) = mpsc::channel(4);
        wrapped.drain(tx, CancellationToken::new());

        let mut names = Vec::new();
        for _ in 0..2 {
            let obj = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("missing event")
                .expect("channel closed");
            names.push(obj.metadata.name.clone().unwrap());
        }
        names.sort();
        assert_eq!(names, vec!["e1", "e2"]);
    }
}
