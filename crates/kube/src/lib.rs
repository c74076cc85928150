//! Argus kube integration: the cluster client boundary and its kube-rs
//! implementation.
//!
//! Upstream LIST/WATCH calls are cluster-wide per kind; namespace
//! filtering happens downstream at fan-out time, which keeps the upstream
//! connection count at one per (cluster, kind) regardless of how many
//! namespaces subscribers care about.

#![forbid(unsafe_code)]

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::{
    api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    Client, Config,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use argus_core::ResourceKind;

/// Stored credential blob for one cluster, as handed out by the cluster
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterCredentials {
    /// Kubeconfig document (YAML).
    pub kubeconfig: String,
    /// Context within the kubeconfig; current-context when unset.
    pub context: Option<String>,
}

/// Errors surfaced by the cluster client boundary.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("resource version expired")]
    Expired,
    #[error("connect: {0}")]
    Connect(String),
    #[error("protocol: {0}")]
    Protocol(String),
}

/// One page of LIST output: items plus the collection cursor to resume
/// watching from.
#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub items: Vec<serde_json::Value>,
    pub resource_version: String,
}

/// Raw change notification from an upstream watch stream.
#[derive(Debug, Clone)]
pub enum RawWatchEvent {
    Added(serde_json::Value),
    Modified(serde_json::Value),
    Deleted(serde_json::Value),
    Bookmark { resource_version: String },
}

pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawWatchEvent, WatchError>> + Send>>;

/// Authenticated handle for one cluster, capable of LIST and WATCH calls
/// per watchable kind.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list(&self, kind: ResourceKind) -> Result<ResourceList, WatchError>;

    /// Open a watch stream resuming from `resource_version`. The stream
    /// ending without an error is the server rotating the watch, not a
    /// failure.
    async fn watch(
        &self,
        kind: ResourceKind,
        resource_version: &str,
    ) -> Result<RawEventStream, WatchError>;
}

/// Builds authenticated cluster handles from stored credentials.
#[async_trait]
pub trait ClusterClientProvider: Send + Sync {
    async fn connect(
        &self,
        credentials: &ClusterCredentials,
    ) -> Result<Arc<dyn ClusterClient>, WatchError>;
}

fn api_resource(kind: ResourceKind) -> ApiResource {
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{Event, Node, Pod};
    match kind {
        ResourceKind::Nodes => ApiResource::erase::<Node>(&()),
        ResourceKind::Pods => ApiResource::erase::<Pod>(&()),
        ResourceKind::Deployments => ApiResource::erase::<Deployment>(&()),
        ResourceKind::Events => ApiResource::erase::<Event>(&()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_raw(obj: &DynamicObject) -> Result<serde_json::Value, WatchError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| WatchError::Protocol(e.to_string()))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn map_watch_item(
    item: Result<KubeWatchEvent<DynamicObject>, kube::Error>,
) -> Result<RawWatchEvent, WatchError> {
    match item {
        Ok(KubeWatchEvent::Added(o)) => to_raw(&o).map(RawWatchEvent::Added),
        Ok(KubeWatchEvent::Modified(o)) => to_raw(&o).map(RawWatchEvent::Modified),
        Ok(KubeWatchEvent::Deleted(o)) => to_raw(&o).map(RawWatchEvent::Deleted),
        Ok(KubeWatchEvent::Bookmark(b)) => Ok(RawWatchEvent::Bookmark {
            resource_version: b.metadata.resource_version,
        }),
        Ok(KubeWatchEvent::Error(status)) if status.code == 410 => Err(WatchError::Expired),
        Ok(KubeWatchEvent::Error(status)) => Err(WatchError::Protocol(status.message)),
        Err(e) => Err(map_kube_err(e)),
    }
}

fn map_kube_err(e: kube::Error) -> WatchError {
    match e {
        kube::Error::Api(resp) if resp.code == 410 => WatchError::Expired,
        kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => {
            WatchError::Auth(resp.message)
        }
        kube::Error::Auth(e) => WatchError::Auth(e.to_string()),
        other => WatchError::Connect(other.to_string()),
    }
}

/// Production provider: builds a kube client from the stored kubeconfig
/// blob.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeClientProvider;

impl KubeClientProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClusterClientProvider for KubeClientProvider {
    async fn connect(
        &self,
        credentials: &ClusterCredentials,
    ) -> Result<Arc<dyn ClusterClient>, WatchError> {
        let kubeconfig = Kubeconfig::from_yaml(&credentials.kubeconfig)
            .map_err(|e| WatchError::Auth(e.to_string()))?;
        let opts = KubeConfigOptions {
            context: credentials.context.clone(),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &opts)
            .await
            .map_err(|e| WatchError::Auth(e.to_string()))?;
        let client = Client::try_from(config).map_err(|e| WatchError::Connect(e.to_string()))?;
        Ok(Arc::new(KubeClusterClient { client }))
    }
}

/// kube-rs backed cluster handle.
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ResourceKind) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &api_resource(kind))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list(&self, kind: ResourceKind) -> Result<ResourceList, WatchError> {
        let list = self
            .api(kind)
            .list(&ListParams::default())
            .await
            .map_err(map_kube_err)?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let mut items = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            items.push(to_raw(obj)?);
        }
        debug!(kind = %kind, items = items.len(), rv = %resource_version, "list complete");
        Ok(ResourceList { items, resource_version })
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        resource_version: &str,
    ) -> Result<RawEventStream, WatchError> {
        // The generator owns the Api so the stream is self-contained; an
        // open failure surfaces as the first stream item.
        let api = self.api(kind);
        let rv = resource_version.to_string();
        let stream = async_stream::stream! {
            let params = WatchParams::default();
            match api.watch(&params, &rv).await {
                Ok(events) => {
                    debug!(kind = %kind, rv = %rv, "watch opened");
                    futures::pin_mut!(events);
                    while let Some(item) = events.next().await {
                        yield map_watch_item(item);
                    }
                }
                Err(e) => yield Err(map_kube_err(e)),
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_fields_are_stripped() {
        let mut raw = serde_json::json!({
            "metadata": {
                "name": "web-1",
                "managedFields": [{"manager": "kubectl"}]
            }
        });
        strip_managed_fields(&mut raw);
        assert!(raw["metadata"].get("managedFields").is_none());
        assert_eq!(raw["metadata"]["name"], "web-1");
    }

    #[test]
    fn api_resources_cover_the_closed_kind_set() {
        for kind in ResourceKind::ALL {
            let ar = api_resource(kind);
            assert_eq!(ar.plural, kind.plural());
        }
        assert_eq!(api_resource(ResourceKind::Deployments).group, "apps");
        assert_eq!(api_resource(ResourceKind::Nodes).group, "");
    }
}
