//! Resource access map built from access reviews

use crate::errors::Result;
use crate::resource::ResourceId;
use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Verbs reviewed for every resource during bulk population.
pub const DEFAULT_ACCESS_VERBS: [&str; 2] = ["list", "watch"];

/// Outcome of one access review for one `(namespace, resource, verb)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessStatus {
    Denied = 0,
    Allowed = 1,
    /// The resource does not support the verb, so no review was issued.
    Unused = 2,
    /// The review itself failed.
    Error = 3,
}

impl AccessStatus {
    pub fn is_allowed(self) -> bool {
        matches!(self, AccessStatus::Allowed)
    }
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Answer from the control plane for a single access review.
#[derive(Debug, Clone, Default)]
pub struct ReviewDecision {
    pub allowed: bool,
    pub reason: String,
    pub evaluation_error: String,
}

/// Issues one `(namespace, resource, verb)` access review at a time.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn review(
        &self,
        namespace: &str,
        resource: &ResourceId,
        verb: &str,
    ) -> Result<ReviewDecision>;
}

fn access_key(namespace: &str, resource: &ResourceId, verb: &str) -> String {
    if namespace.is_empty() {
        format!("{}.{}", resource.key(), verb)
    } else {
        format!("{}.{}.{}", namespace, resource.key(), verb)
    }
}

/// Concurrent map of review outcomes, keyed by namespace, resource key and
/// verb.
///
/// Entries are only ever written or overwritten; the ordered backing map
/// keeps the diagnostic dump deterministic.
pub struct ResourceAccess {
    access: RwLock<BTreeMap<String, AccessStatus>>,
    minimum_verbs: Vec<String>,
}

impl Default for ResourceAccess {
    fn default() -> Self {
        ResourceAccess::new()
    }
}

impl ResourceAccess {
    pub fn new() -> Self {
        ResourceAccess {
            access: RwLock::new(BTreeMap::new()),
            minimum_verbs: DEFAULT_ACCESS_VERBS.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Overrides the verbs reviewed during bulk population.
    pub fn with_minimum_verbs(verbs: &[&str]) -> Self {
        ResourceAccess {
            access: RwLock::new(BTreeMap::new()),
            minimum_verbs: verbs.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn minimum_verbs(&self) -> &[String] {
        &self.minimum_verbs
    }

    /// Builds a map populated for every resource, reviewing the minimum
    /// verbs concurrently, one task per resource.
    pub async fn new_populated(
        reviewer: Arc<dyn AccessReviewer>,
        namespace: &str,
        resources: Vec<ResourceId>,
        cancel: CancellationToken,
    ) -> Arc<ResourceAccess> {
        let access = Arc::new(ResourceAccess::new());
        Arc::clone(&access)
            .populate(&reviewer, namespace, resources, &cancel)
            .await;
        access
    }

    /// Reviews the minimum verbs for each resource, one task per resource,
    /// checking `cancel` before every review.
    pub async fn populate(
        self: Arc<Self>,
        reviewer: &Arc<dyn AccessReviewer>,
        namespace: &str,
        resources: Vec<ResourceId>,
        cancel: &CancellationToken,
    ) {
        let mut tasks = Vec::with_capacity(resources.len());
        for resource in resources {
            let access = Arc::clone(&self);
            let reviewer = Arc::clone(reviewer);
            let namespace = namespace.to_string();
            let cancel = cancel.clone();
            tasks.push(tokio::task::spawn(async move {
                for verb in access.minimum_verbs.clone() {
                    if cancel.is_cancelled() {
                        return;
                    }
                    access
                        .update(reviewer.as_ref(), &namespace, &resource, &verb)
                        .await;
                }
            }));
        }
        futures::future::join_all(tasks).await;
    }

    /// Issues one review and records the outcome.
    ///
    /// Cluster-scoped resources are recorded under the empty namespace
    /// regardless of the namespace passed in; reads do not normalize, so
    /// callers are expected to pass `""` for cluster resources.
    pub async fn update(
        &self,
        reviewer: &dyn AccessReviewer,
        namespace: &str,
        resource: &ResourceId,
        verb: &str,
    ) {
        let namespace = if resource.namespaced { namespace } else { "" };
        let key = access_key(namespace, resource, verb);

        if !resource.supports_verb(verb) {
            self.store(key, AccessStatus::Unused);
            return;
        }

        match reviewer.review(namespace, resource, verb).await {
            Err(err) => {
                tracing::warn!(
                    resource = %resource.key(),
                    verb = %verb,
                    error = %err,
                    "access review failed"
                );
                self.store(key, AccessStatus::Error);
            }
            Ok(decision) if decision.allowed => self.store(key, AccessStatus::Allowed),
            Ok(decision) => {
                tracing::warn!(
                    resource = %resource.key(),
                    verbs = ?resource.verbs,
                    minimum_verbs = ?self.minimum_verbs,
                    reason = %decision.reason,
                    "resource failed minimum RBAC requirement"
                );
                self.store(key, AccessStatus::Denied);
            }
        }
    }

    /// True iff the recorded status for the verb is `Allowed`.
    pub fn allowed(&self, namespace: &str, resource: &ResourceId, verb: &str) -> bool {
        let key = access_key(namespace, resource, verb);
        match self.read().get(&key) {
            None => {
                tracing::debug!(key = %key, "access status not found");
                false
            }
            Some(status) => status.is_allowed(),
        }
    }

    pub fn allowed_all(&self, namespace: &str, resource: &ResourceId, verbs: &[&str]) -> bool {
        verbs.iter().all(|verb| self.allowed(namespace, resource, verb))
    }

    pub fn allowed_any(&self, namespace: &str, resource: &ResourceId, verbs: &[&str]) -> bool {
        verbs.iter().any(|verb| self.allowed(namespace, resource, verb))
    }

    /// Recorded status, if any. Reads do not normalize the namespace.
    pub fn status(
        &self,
        namespace: &str,
        resource: &ResourceId,
        verb: &str,
    ) -> Option<AccessStatus> {
        self.read().get(&access_key(namespace, resource, verb)).copied()
    }

    fn store(&self, key: String, status: AccessStatus) {
        self.access
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, status);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, AccessStatus>> {
        self.access
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Display for ResourceAccess {
    /// Deterministic dump of every recorded key and numeric status.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, status) in self.read().iter() {
            writeln!(f, "{}: {}", key, status)?;
        }
        Ok(())
    }
}

/// Access reviewer backed by the cluster's SelfSubjectAccessReview API.
pub struct SelfSubjectAccessReviewer {
    api: Api<SelfSubjectAccessReview>,
}

impl SelfSubjectAccessReviewer {
    pub fn new(client: kube::Client) -> Self {
        SelfSubjectAccessReviewer {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl AccessReviewer for SelfSubjectAccessReviewer {
    async fn review(
        &self,
        namespace: &str,
        resource: &ResourceId,
        verb: &str,
    ) -> Result<ReviewDecision> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(verb.to_string()),
                    resource: Some(resource.plural.clone()),
                    group: Some(resource.group.clone()),
                    namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = self.api.create(&PostParams::default(), &review).await?;
        let status = created.status.unwrap_or_default();
        Ok(ReviewDecision {
            allowed: status.allowed,
            reason: status.reason.unwrap_or_default(),
            evaluation_error: status.evaluation_error.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{deployment_resource, FakeAccessReviewer};

    async fn populated(reviewer: FakeAccessReviewer) -> Arc<ResourceAccess> {
        let reviewer: Arc<dyn AccessReviewer> = Arc::new(reviewer);
        ResourceAccess::new_populated(
            reviewer,
            "default",
            vec![deployment_resource()],
            CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn failed_reviews_record_error_and_deny() {
        let access = ResourceAccess::new();
        let reviewer = FakeAccessReviewer::failing();
        let deployments = deployment_resource();
        access.update(&reviewer, "default", &deployments, "list").await;
        access.update(&reviewer, "default", &deployments, "watch").await;

        assert!(!access.allowed("default", &deployments, "list"));
        assert!(!access.allowed_all("default", &deployments, &["list", "watch"]));
        assert!(!access.allowed_any("default", &deployments, &["list", "watch"]));

        let dump = access.to_string();
        assert!(dump.contains("default.apps.v1.Deployment.list: 3"));
        assert!(dump.contains("default.apps.v1.Deployment.watch: 3"));
    }

    #[tokio::test]
    async fn allowed_reviews_record_allowed() {
        let access = populated(FakeAccessReviewer::allowing()).await;
        let deployments = deployment_resource();

        assert!(access.allowed("default", &deployments, "list"));
        assert!(access.allowed_all("default", &deployments, &["list", "watch"]));
        assert!(access.allowed_any("default", &deployments, &["list", "watch"]));

        let dump = access.to_string();
        assert!(dump.contains("default.apps.v1.Deployment.list: 1"));
        assert!(dump.contains("default.apps.v1.Deployment.watch: 1"));
    }

    #[tokio::test]
    async fn denied_reviews_record_denied() {
        let access = populated(FakeAccessReviewer::denying()).await;
        let deployments = deployment_resource();

        assert!(!access.allowed_all("default", &deployments, &["list", "watch"]));
        assert_eq!(
            access.status("default", &deployments, "list"),
            Some(AccessStatus::Denied)
        );
        assert_eq!(
            access.status("default", &deployments, "watch"),
            Some(AccessStatus::Denied)
        );
    }

    #[tokio::test]
    async fn unsupported_verbs_are_recorded_unused_without_review() {
        let access = ResourceAccess::new();
        let reviewer = FakeAccessReviewer::failing();
        let deployments = deployment_resource();

        access.update(&reviewer, "default", &deployments, "patch").await;

        assert!(!access.allowed("default", &deployments, "patch"));
        assert_eq!(
            access.status("default", &deployments, "patch"),
            Some(AccessStatus::Unused)
        );
    }

    #[tokio::test]
    async fn cluster_scoped_resources_are_recorded_without_namespace() {
        let access = ResourceAccess::new();
        let reviewer = FakeAccessReviewer::allowing();
        let nodes = crate::testing::node_resource();

        access.update(&reviewer, "default", &nodes, "list").await;

        // the write normalized the namespace away; the read does not
        assert!(!access.allowed("default", &nodes, "list"));
        assert!(access.allowed("", &nodes, "list"));
        assert!(access.to_string().contains("v1.Node.list: 1"));
    }

    #[tokio::test]
    async fn missing_keys_are_not_allowed() {
        let access = ResourceAccess::new();
        assert!(!access.allowed("default", &deployment_resource(), "list"));
    }

    #[tokio::test]
    async fn populate_honors_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reviewer: Arc<dyn AccessReviewer> = Arc::new(FakeAccessReviewer::allowing());
        let access = ResourceAccess::new_populated(
            reviewer,
            "default",
            vec![deployment_resource()],
            cancel,
        )
        .await;
        assert!(access.to_string().is_empty());
    }

    #[test]
    fn dump_is_sorted() {
        let access = ResourceAccess::new();
        access.store("b.key".to_string(), AccessStatus::Allowed);
        access.store("a.key".to_string(), AccessStatus::Denied);
        assert_eq!(access.to_string(), "a.key: 0\nb.key: 1\n");
    }
}
