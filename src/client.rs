//! High-level client: discovery, access checks and watch helpers

use crate::access::{
    AccessReviewer, ResourceAccess, SelfSubjectAccessReviewer, DEFAULT_ACCESS_VERBS,
};
use crate::cache::{
    ResourceCatalog, ResourceLister, ResourceScope, WatchEntry, Watcher,
};
use crate::discovery::{ApiServerResources, ServerResources};
use crate::errors::{Error, Result};
use crate::informer::InformerFactory;
use crate::resource::{partition_by_scope, ResourceId};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Transport capacity below these marks draws a warning; large clusters
/// issue bursts of reviews and list calls during discovery.
const RECOMMENDED_QPS: f32 = 400.0;
const RECOMMENDED_BURST: u32 = 800;

/// Entry point tying discovery, access reviews and the watch registry
/// together over one transport.
pub struct Client {
    kube: Option<kube::Client>,
    server_resources: Arc<dyn ServerResources>,
    reviewer: Arc<dyn AccessReviewer>,
    watcher: Watcher,
    catalog: Arc<ResourceCatalog>,
    access: RwLock<Option<Arc<ResourceAccess>>>,
    namespaces: RwLock<Vec<String>>,
    skip_access_checks: bool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("watcher", &self.watcher)
            .field("skip_access_checks", &self.skip_access_checks)
            .finish()
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    config: Option<kube::Config>,
    client: Option<kube::Client>,
    server_resources: Option<Arc<dyn ServerResources>>,
    reviewer: Option<Arc<dyn AccessReviewer>>,
    informer_factory: Option<Arc<dyn InformerFactory>>,
    namespace: Option<String>,
    resync: Option<Duration>,
    skip_access_checks: bool,
    qps: Option<f32>,
    burst: Option<u32>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    /// Builds the transport from a kube config at construction time.
    pub fn config(mut self, config: kube::Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses an already constructed transport.
    pub fn client(mut self, client: kube::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn server_resources(mut self, server_resources: Arc<dyn ServerResources>) -> Self {
        self.server_resources = Some(server_resources);
        self
    }

    pub fn access_reviewer(mut self, reviewer: Arc<dyn AccessReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn informer_factory(mut self, factory: Arc<dyn InformerFactory>) -> Self {
        self.informer_factory = Some(factory);
        self
    }

    /// Constrains the client's watcher to one namespace.
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn resync(mut self, resync: Duration) -> Self {
        self.resync = Some(resync);
        self
    }

    /// Disables the access gate in front of watch creation.
    pub fn skip_access_checks(mut self, skip: bool) -> Self {
        self.skip_access_checks = skip;
        self
    }

    /// Declares the transport's client-side rate limits so undersized
    /// configurations can be flagged.
    pub fn rate_limits(mut self, qps: f32, burst: u32) -> Self {
        self.qps = Some(qps);
        self.burst = Some(burst);
        self
    }

    pub fn build(self) -> Result<Client> {
        let kube_client = match (self.client, self.config) {
            (Some(client), _) => Some(client),
            (None, Some(config)) => {
                Some(kube::Client::try_from(config).map_err(Error::TransportInit)?)
            }
            (None, None) => None,
        };
        check_transport_limits(self.qps, self.burst);

        let server_resources: Arc<dyn ServerResources> =
            match (self.server_resources, &kube_client) {
                (Some(server_resources), _) => server_resources,
                (None, Some(client)) => Arc::new(ApiServerResources::new(client.clone())),
                (None, None) => return Err(Error::MissingClient),
            };
        let reviewer: Arc<dyn AccessReviewer> = match (self.reviewer, &kube_client) {
            (Some(reviewer), _) => reviewer,
            (None, Some(client)) => Arc::new(SelfSubjectAccessReviewer::new(client.clone())),
            (None, None) => return Err(Error::MissingClient),
        };

        let mut watcher = Watcher::builder();
        if let Some(client) = &kube_client {
            watcher = watcher.client(client.clone());
        }
        if let Some(factory) = self.informer_factory {
            watcher = watcher.informer_factory(factory);
        }
        if let Some(namespace) = &self.namespace {
            watcher = watcher.namespace(namespace);
        }
        if let Some(resync) = self.resync {
            watcher = watcher.resync(resync);
        }
        let watcher = watcher.build()?;

        Ok(Client {
            kube: kube_client,
            server_resources,
            reviewer,
            watcher,
            catalog: Arc::new(ResourceCatalog::new()),
            access: RwLock::new(None),
            namespaces: RwLock::new(Vec::new()),
            skip_access_checks: self.skip_access_checks,
        })
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    pub fn catalog(&self) -> Arc<ResourceCatalog> {
        self.catalog.clone()
    }

    /// Access map built by the last discovery, if any.
    pub fn access(&self) -> Option<Arc<ResourceAccess>> {
        self.read_access()
    }

    /// Namespace names cached by the last `discover_namespaces`.
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Lists the cluster's namespaces and caches their names.
    pub async fn discover_namespaces(&self) -> Result<Vec<String>> {
        tracing::info!("discovering namespaces");
        let client = self.kube.clone().ok_or(Error::MissingClient)?;
        let api: Api<Namespace> = Api::all(client);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(Error::DiscoveryFailure)?;
        let names: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect();
        *self
            .namespaces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = names.clone();
        Ok(names)
    }

    /// Enumerates served resource types into the catalog.
    ///
    /// Cluster-wide and namespaced enumerations run concurrently; partial
    /// results are kept and per-call failures are reported together. This
    /// is expensive on large clusters and meant for startup and periodic
    /// refresh, not per-request use.
    pub async fn discover_resources(&self) -> Result<()> {
        tracing::info!("discovering resources");
        let failures: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let record = |err: Error| {
            failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(err.to_string());
        };

        let (all, namespaced) = tokio::join!(
            self.server_resources.preferred_resources(),
            self.server_resources.preferred_namespaced_resources(),
        );
        match all {
            Ok(resources) => {
                let (cluster, _) = partition_by_scope(resources);
                self.catalog.add(ResourceScope::Cluster, cluster);
            }
            Err(err) => record(err),
        }
        match namespaced {
            Ok(resources) => self.catalog.add(ResourceScope::Namespaced, resources),
            Err(err) => record(err),
        }

        let causes = failures
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if causes.is_empty() {
            Ok(())
        } else {
            Err(Error::ResourceDiscovery { causes })
        }
    }

    /// Reviews access for every cataloged resource under one namespace and
    /// installs the resulting map.
    pub async fn discover_access(
        &self,
        namespace: &str,
        cancel: CancellationToken,
    ) -> Result<Arc<ResourceAccess>> {
        let mut resources = self.catalog.get(ResourceScope::Namespaced);
        resources.extend(self.catalog.get(ResourceScope::Cluster));
        let access =
            ResourceAccess::new_populated(self.reviewer.clone(), namespace, resources, cancel)
                .await;
        self.install_access(access.clone());
        Ok(access)
    }

    /// Re-reviews the default verbs for one resource.
    pub async fn update_access(
        &self,
        namespace: &str,
        resource: &ResourceId,
    ) -> Result<Arc<ResourceAccess>> {
        let access = self
            .read_access()
            .unwrap_or_else(|| Arc::new(ResourceAccess::new()));
        for verb in DEFAULT_ACCESS_VERBS {
            access
                .update(self.reviewer.as_ref(), namespace, resource, verb)
                .await;
        }
        self.install_access(access.clone());
        Ok(access)
    }

    /// Creates watches for the resource in the given namespaces.
    ///
    /// A cluster-wide sentinel anywhere in the list collapses the fan-out
    /// into one cluster-wide watch. Unless access checks are skipped, each
    /// watch is gated on the recorded list/watch permissions.
    pub fn watch_resource(
        &self,
        resource: &ResourceId,
        queue_events: bool,
        namespaces: &[&str],
    ) -> Result<Vec<Arc<dyn ResourceLister>>> {
        if namespaces.iter().any(|ns| ns.is_empty()) {
            self.ensure_access("", resource)?;
            return Ok(vec![self.watcher.watch("", resource, queue_events)?]);
        }

        let mut views = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            self.ensure_access(namespace, resource)?;
            tracing::info!(
                resource = %resource.key(),
                namespace = %namespace,
                "creating watch"
            );
            views.push(self.watcher.watch(namespace, resource, queue_events)?);
        }
        Ok(views)
    }

    /// Watches every cataloged namespaced resource, skipping (and logging)
    /// the ones that fail.
    pub fn watch_all_resources(
        &self,
        queue_events: bool,
        namespaces: &[&str],
    ) -> Vec<Arc<dyn ResourceLister>> {
        let mut views = Vec::new();
        for resource in self.catalog.get(ResourceScope::Namespaced) {
            match self.watch_resource(&resource, queue_events, namespaces) {
                Ok(mut created) => views.append(&mut created),
                Err(err) => {
                    tracing::warn!(
                        resource = %resource.key(),
                        error = %err,
                        "failed to watch resource"
                    );
                }
            }
        }
        views
    }

    pub fn watch_list(&self, only_running: bool) -> Vec<Arc<WatchEntry>> {
        self.watcher.list(only_running)
    }

    pub fn watch_count(&self, only_running: bool) -> usize {
        self.watcher.count(only_running)
    }

    /// Process-wide teardown of every watch.
    pub fn stop_all(&self) {
        self.watcher.stop_all();
    }

    fn ensure_access(&self, namespace: &str, resource: &ResourceId) -> Result<()> {
        if self.skip_access_checks {
            return Ok(());
        }
        let access = match self.read_access() {
            Some(access) => access,
            // nothing discovered yet, nothing to gate on
            None => return Ok(()),
        };
        for verb in DEFAULT_ACCESS_VERBS {
            if !access.allowed(namespace, resource, verb) {
                return Err(Error::AccessDenied {
                    resource: resource.key(),
                    verb: verb.to_string(),
                });
            }
        }
        Ok(())
    }

    fn read_access(&self) -> Option<Arc<ResourceAccess>> {
        self.access
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn install_access(&self, access: Arc<ResourceAccess>) {
        *self
            .access
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(access);
    }
}

fn check_transport_limits(qps: Option<f32>, burst: Option<u32>) {
    if let Some(qps) = qps {
        if qps < RECOMMENDED_QPS {
            tracing::warn!(qps, recommended = ">=400", "transport QPS below recommended");
        }
    }
    if let Some(burst) = burst {
        if burst < RECOMMENDED_BURST {
            tracing::warn!(burst, recommended = ">=800", "transport burst below recommended");
        }
    }
}
