//! Argus HTTP surface: the per-cluster streaming endpoint and health
//! poll, served by axum. The watch manager and cluster registry are
//! injected; this crate owns only the wire.

#![forbid(unsafe_code)]

mod sse;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tracing::info;

use argus_kube::ClusterCredentials;
use argus_watch::WatchManager;

/// Lookup of stored cluster credentials. Persistence of cluster records
/// lives elsewhere; this is the whole interface the sync path needs.
pub trait ClusterRegistry: Send + Sync {
    fn lookup(&self, cluster_id: &str) -> Option<ClusterCredentials>;
}

/// Registry reading `<dir>/<cluster>.yaml` kubeconfigs.
pub struct KubeconfigDirRegistry {
    dir: PathBuf,
}

impl KubeconfigDirRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ClusterRegistry for KubeconfigDirRegistry {
    fn lookup(&self, cluster_id: &str) -> Option<ClusterCredentials> {
        // Cluster ids come straight from the URL; keep them inside the dir.
        if cluster_id.is_empty()
            || cluster_id.contains('/')
            || cluster_id.contains('\\')
            || cluster_id.contains("..")
        {
            return None;
        }
        let path = self.dir.join(format!("{cluster_id}.yaml"));
        let kubeconfig = std::fs::read_to_string(path).ok()?;
        Some(ClusterCredentials { kubeconfig, context: None })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    pub keepalive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8084).into(),
            keepalive: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let http_addr = std::env::var("ARGUS_HTTP_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.http_addr);
        let keepalive = std::env::var("ARGUS_KEEPALIVE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.keepalive);
        Self { http_addr, keepalive }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) struct AppState {
    pub manager: WatchManager,
    pub registry: Arc<dyn ClusterRegistry>,
    pub keepalive: Duration,
}

pub fn router(
    manager: WatchManager,
    registry: Arc<dyn ClusterRegistry>,
    keepalive: Duration,
) -> Router {
    let state = Arc::new(AppState { manager, registry, keepalive });
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/clusters/:cluster/health", get(sse::cluster_health))
        .route("/api/clusters/:cluster/stream", get(sse::stream))
        .with_state(state)
}

pub async fn start_server(
    config: ServerConfig,
    manager: WatchManager,
    registry: Arc<dyn ClusterRegistry>,
) -> Result<(), ServerError> {
    let app = router(manager, registry, config.keepalive);
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "argus server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
