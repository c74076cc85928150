//! Argus core types: the closed watchable-kind set, cache entries, watch
//! events and the derived health rollup shared by server and client.

#![forbid(unsafe_code)]

mod backoff;

pub use backoff::Backoff;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of resource kinds the dashboard synchronizes.
///
/// Adding a kind means adding a cache shape and a list/watch mapping,
/// nothing structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Nodes,
    Pods,
    Deployments,
    Events,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Nodes,
        ResourceKind::Pods,
        ResourceKind::Deployments,
        ResourceKind::Events,
    ];

    /// Wire event name for single-object change frames.
    pub fn singular(&self) -> &'static str {
        match self {
            ResourceKind::Nodes => "node",
            ResourceKind::Pods => "pod",
            ResourceKind::Deployments => "deployment",
            ResourceKind::Events => "event",
        }
    }

    /// Wire event name for snapshot frames; also the query-parameter token.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Nodes => "nodes",
            ResourceKind::Pods => "pods",
            ResourceKind::Deployments => "deployments",
            ResourceKind::Events => "events",
        }
    }

    pub fn cluster_scoped(&self) -> bool {
        matches!(self, ResourceKind::Nodes)
    }

    pub fn from_singular(name: &str) -> Option<ResourceKind> {
        match name {
            "node" => Some(ResourceKind::Nodes),
            "pod" => Some(ResourceKind::Pods),
            "deployment" => Some(ResourceKind::Deployments),
            "event" => Some(ResourceKind::Events),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nodes" => Ok(ResourceKind::Nodes),
            "pods" => Ok(ResourceKind::Pods),
            "deployments" => Ok(ResourceKind::Deployments),
            "events" => Ok(ResourceKind::Events),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Identity of an object within one (cluster, kind).
///
/// Namespace is `None` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    /// Extract the key from a raw object; `None` when metadata.name is absent.
    pub fn from_object(raw: &serde_json::Value) -> Option<ResourceKey> {
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?.to_string();
        let namespace = meta
            .get("namespace")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Some(ResourceKey { namespace, name })
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Last-known state of one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedObject {
    pub key: ResourceKey,
    pub resource_version: String,
    pub raw: serde_json::Value,
}

/// Highest-resourceVersion-wins replacement rule.
///
/// Versions are opaque cursors; when both sides parse as integers they
/// compare numerically, otherwise only inequality is detectable and a
/// differing version is accepted.
pub fn supersedes(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => candidate != current,
    }
}

/// Pull an object's own resourceVersion out of its metadata.
pub fn object_resource_version(raw: &serde_json::Value) -> Option<&str> {
    raw.get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(|v| v.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    Added,
    Modified,
    Deleted,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Added => "ADDED",
            ChangeAction::Modified => "MODIFIED",
            ChangeAction::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown change action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for ChangeAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADDED" => Ok(ChangeAction::Added),
            "MODIFIED" => Ok(ChangeAction::Modified),
            "DELETED" => Ok(ChangeAction::Deleted),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

/// One event published to subscribers.
///
/// Closed union; the SSE bridge owns the only mapping from variants to
/// wire event names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WatchEvent {
    /// Single-object delta observed on an upstream watch stream.
    Change {
        kind: ResourceKind,
        action: ChangeAction,
        object: serde_json::Value,
        resource_version: Option<String>,
    },
    /// Full current state of one kind, ordered by key.
    Snapshot {
        kind: ResourceKind,
        objects: Vec<serde_json::Value>,
        resource_version: Option<String>,
    },
    /// Derived health rollup; not tied to a single kind.
    Health { snapshot: HealthSnapshot },
}

impl WatchEvent {
    pub fn kind(&self) -> Option<ResourceKind> {
        match self {
            WatchEvent::Change { kind, .. } | WatchEvent::Snapshot { kind, .. } => Some(*kind),
            WatchEvent::Health { .. } => None,
        }
    }
}

/// Cluster health rollup derived from the node, pod, deployment and event
/// caches.
///
/// Utilization is `None` with `metrics_available = false` when no metrics
/// source is wired up, so consumers can tell "no load" from "unknown".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub nodes_ready: u32,
    pub nodes_total: u32,
    pub pods_running: u32,
    pub pods_pending: u32,
    pub pods_failed: u32,
    pub pods_total: u32,
    pub deployments_healthy: u32,
    pub deployments_total: u32,
    pub warning_events: u32,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub metrics_available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_plural_names() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.plural().parse::<ResourceKind>().unwrap(), kind);
            assert_eq!(ResourceKind::from_singular(kind.singular()), Some(kind));
        }
        assert!("pod".parse::<ResourceKind>().is_err());
        assert!("replicasets".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn supersedes_orders_numeric_versions() {
        assert!(supersedes("11", "10"));
        assert!(!supersedes("10", "10"));
        assert!(!supersedes("9", "10"));
        // opaque versions: replace on change only
        assert!(supersedes("abc", "def"));
        assert!(!supersedes("abc", "abc"));
    }

    #[test]
    fn key_extraction_handles_cluster_scoped_objects() {
        let pod = serde_json::json!({"metadata": {"name": "web-1", "namespace": "prod"}});
        let node = serde_json::json!({"metadata": {"name": "worker-0"}});
        assert_eq!(
            ResourceKey::from_object(&pod).unwrap(),
            ResourceKey { namespace: Some("prod".into()), name: "web-1".into() }
        );
        assert_eq!(ResourceKey::from_object(&node).unwrap().namespace, None);
        assert!(ResourceKey::from_object(&serde_json::json!({})).is_none());
    }
}
