#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use argus_core::{ResourceKind, WatchEvent};
use argus_kube::{
    ClusterClient, ClusterClientProvider, ClusterCredentials, RawEventStream, RawWatchEvent,
    ResourceList, WatchError,
};
use argus_watch::{Subscription, WatchConfig, WatchManager};

/// Scripted cluster client: a canned LIST response plus a queue of
/// test-driven watch streams. A watch call with no queued stream hangs
/// open without yielding, like a quiet cluster.
pub struct FakeClient {
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
    list_response: Mutex<ResourceList>,
    streams: Mutex<VecDeque<mpsc::Receiver<Result<RawWatchEvent, WatchError>>>>,
}

impl FakeClient {
    pub fn new(items: Vec<Value>, rv: &str) -> Arc<Self> {
        Arc::new(Self {
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
            list_response: Mutex::new(ResourceList {
                items,
                resource_version: rv.to_string(),
            }),
            streams: Mutex::new(VecDeque::new()),
        })
    }

    pub fn set_list(&self, items: Vec<Value>, rv: &str) {
        *self.list_response.lock().unwrap() = ResourceList {
            items,
            resource_version: rv.to_string(),
        };
    }

    /// Queue the next watch stream; the returned sender drives it, and
    /// dropping the sender ends the stream cleanly.
    pub fn push_stream(&self) -> mpsc::Sender<Result<RawWatchEvent, WatchError>> {
        let (tx, rx) = mpsc::channel(64);
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    pub fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watches(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn list(&self, _kind: ResourceKind) -> Result<ResourceList, WatchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.list_response.lock().unwrap().clone())
    }

    async fn watch(
        &self,
        _kind: ResourceKind,
        _resource_version: &str,
    ) -> Result<RawEventStream, WatchError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        match self.streams.lock().unwrap().pop_front() {
            Some(rx) => Ok(Box::pin(ReceiverStream::new(rx))),
            None => Ok(Box::pin(futures::stream::pending())),
        }
    }
}

pub struct FakeProvider {
    pub client: Arc<FakeClient>,
    pub connects: AtomicUsize,
}

impl FakeProvider {
    pub fn new(client: Arc<FakeClient>) -> Arc<Self> {
        Arc::new(Self { client, connects: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl ClusterClientProvider for FakeProvider {
    async fn connect(
        &self,
        _credentials: &ClusterCredentials,
    ) -> Result<Arc<dyn ClusterClient>, WatchError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.client.clone())
    }
}

pub fn creds() -> ClusterCredentials {
    ClusterCredentials { kubeconfig: "apiVersion: v1\nkind: Config\n".into(), context: None }
}

pub fn test_config() -> WatchConfig {
    WatchConfig {
        queue_cap: 64,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(40),
        stop_grace: Duration::from_millis(50),
    }
}

pub fn manager(client: &Arc<FakeClient>) -> WatchManager {
    WatchManager::new(FakeProvider::new(client.clone()), test_config())
}

pub fn pod(name: &str, ns: &str, rv: &str) -> Value {
    json!({
        "metadata": {"name": name, "namespace": ns, "resourceVersion": rv},
        "status": {"phase": "Running"}
    })
}

pub fn node(name: &str, rv: &str, ready: bool) -> Value {
    json!({
        "metadata": {"name": name, "resourceVersion": rv},
        "status": {"conditions": [{"type": "Ready", "status": if ready { "True" } else { "False" }}]}
    })
}

/// Next event, bounded by a timeout so a broken fan-out fails fast.
pub async fn recv(sub: &mut Subscription) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(2), sub.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Next non-health event.
pub async fn recv_resource(sub: &mut Subscription) -> WatchEvent {
    loop {
        let ev = recv(sub).await;
        if !matches!(ev, WatchEvent::Health { .. }) {
            return ev;
        }
    }
}

/// Assert no resource event arrives within a short window (health events
/// are ignored).
pub async fn assert_no_resource_event(sub: &mut Subscription) {
    loop {
        match tokio::time::timeout(Duration::from_millis(100), sub.events.recv()).await {
            Err(_) => return,
            Ok(Some(WatchEvent::Health { .. })) => continue,
            Ok(Some(other)) => panic!("unexpected event: {other:?}"),
            Ok(None) => panic!("event channel closed"),
        }
    }
}
