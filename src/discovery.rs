//! Server resource enumeration

use crate::errors::{Error, Result};
use crate::resource::ResourceId;
use async_trait::async_trait;
use kube::discovery::{Discovery, Scope};
use std::collections::BTreeSet;

/// Enumerates the resource types the server serves.
#[async_trait]
pub trait ServerResources: Send + Sync {
    /// Preferred version of every served resource type.
    async fn preferred_resources(&self) -> Result<Vec<ResourceId>>;

    /// Preferred version of the namespaced resource types only.
    async fn preferred_namespaced_resources(&self) -> Result<Vec<ResourceId>>;
}

/// Discovery backed by the cluster's API groups.
pub struct ApiServerResources {
    client: kube::Client,
}

impl ApiServerResources {
    pub fn new(client: kube::Client) -> Self {
        ApiServerResources { client }
    }

    async fn enumerate(&self) -> Result<Vec<ResourceId>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(Error::DiscoveryFailure)?;

        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let verbs: BTreeSet<String> = caps.operations.iter().cloned().collect();
                if verbs.is_empty() {
                    continue;
                }
                out.push(ResourceId {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    verbs,
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
        out.sort_by_key(|r| r.key());
        Ok(out)
    }
}

#[async_trait]
impl ServerResources for ApiServerResources {
    async fn preferred_resources(&self) -> Result<Vec<ResourceId>> {
        self.enumerate().await
    }

    async fn preferred_namespaced_resources(&self) -> Result<Vec<ResourceId>> {
        let mut resources = self.enumerate().await?;
        resources.retain(|r| r.namespaced);
        Ok(resources)
    }
}
