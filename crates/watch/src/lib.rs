//! Argus watch multiplexer.
//!
//! One upstream LIST/WATCH session exists per (cluster, kind) no matter
//! how many subscribers overlap; interest is reference-counted and a
//! session is torn down a grace period after its count reaches zero, so a
//! page reload does not force a redundant relist. Events fan out to
//! per-subscriber channels, namespace-filtered, and every accepted cache
//! mutation re-derives the cluster health rollup.

#![forbid(unsafe_code)]

pub mod health;
mod session;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use argus_core::{
    object_resource_version, supersedes, CachedObject, ChangeAction, HealthSnapshot, ResourceKey,
    ResourceKind, WatchEvent,
};
use argus_kube::{ClusterClient, ClusterClientProvider, ClusterCredentials, RawWatchEvent, WatchError};

/// Tuning knobs for the multiplexer.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Per-subscriber event channel capacity.
    pub queue_cap: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// How long a session with no subscribers stays alive before teardown.
    pub stop_grace: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            queue_cap: 2048,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            stop_grace: Duration::from_secs(3),
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let queue_cap = std::env::var("ARGUS_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.queue_cap);
        let backoff_base = std::env::var("ARGUS_WATCH_BACKOFF_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.backoff_base);
        let backoff_cap = std::env::var("ARGUS_WATCH_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.backoff_cap);
        let stop_grace = std::env::var("ARGUS_STOP_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.stop_grace);
        Self { queue_cap, backoff_base, backoff_cap, stop_grace }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("no valid resource kinds requested")]
    EmptyKinds,
    #[error("cluster connect failed: {0}")]
    Connect(#[from] WatchError),
}

/// Lifecycle of one upstream (cluster, kind) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Listing,
    Streaming,
    Retrying,
    Stopped,
}

/// The multiplexer. Explicitly constructed and injected; owns every
/// upstream session across all clusters.
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    provider: Arc<dyn ClusterClientProvider>,
    cfg: WatchConfig,
    clusters: Mutex<HashMap<String, ClusterState>>,
    /// Monotonic session id source. Epochs are never reused, so a
    /// cancelled session that lost a shutdown race can never write into a
    /// successor's slot.
    session_seq: AtomicU64,
}

struct ClusterState {
    client: Arc<dyn ClusterClient>,
    kinds: HashMap<ResourceKind, KindState>,
    subs: HashMap<Uuid, Subscriber>,
}

impl ClusterState {
    fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client, kinds: HashMap::new(), subs: HashMap::new() }
    }
}

struct KindState {
    cache: FxHashMap<ResourceKey, CachedObject>,
    populated: bool,
    last_rv: Option<String>,
    status: SessionStatus,
    refcount: usize,
    /// Epoch of the session currently owning this slot; zero when none
    /// ever started.
    epoch: u64,
    cancel: CancellationToken,
    grace: Option<JoinHandle<()>>,
}

impl KindState {
    fn new() -> Self {
        Self {
            cache: FxHashMap::default(),
            populated: false,
            last_rv: None,
            status: SessionStatus::Idle,
            refcount: 0,
            epoch: 0,
            cancel: CancellationToken::new(),
            grace: None,
        }
    }
}

struct Subscriber {
    kinds: BTreeSet<ResourceKind>,
    namespace: Option<String>,
    tx: mpsc::Sender<WatchEvent>,
}

/// One subscriber's view of a cluster: an event receiver plus a guard
/// that releases upstream interest. Dropping the subscription (or calling
/// [`Subscription::unsubscribe`]) is idempotent.
pub struct Subscription {
    pub id: Uuid,
    pub events: mpsc::Receiver<WatchEvent>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn unsubscribe(&mut self) {
        self.guard.release();
    }
}

struct SubscriptionGuard {
    inner: Weak<Inner>,
    cluster: String,
    id: Uuid,
    released: bool,
}

impl SubscriptionGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(&self.cluster, self.id);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl WatchManager {
    pub fn new(provider: Arc<dyn ClusterClientProvider>, cfg: WatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                cfg,
                clusters: Mutex::new(HashMap::new()),
                session_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a subscriber to a cluster.
    ///
    /// Starts (or attaches to) one upstream session per requested kind.
    /// Kinds whose cache is already populated deliver a SNAPSHOT into the
    /// subscription channel before this returns, so a late joiner never
    /// waits for the next upstream tick.
    pub async fn subscribe(
        &self,
        cluster_id: &str,
        credentials: &ClusterCredentials,
        kinds: &[ResourceKind],
        namespace: Option<String>,
    ) -> Result<Subscription, SubscribeError> {
        let kinds: BTreeSet<ResourceKind> = kinds.iter().copied().collect();
        if kinds.is_empty() {
            return Err(SubscribeError::EmptyKinds);
        }

        // Connect outside the lock; reuse the live handle when the cluster
        // is already being watched.
        let existing = {
            let clusters = self.inner.clusters.lock().unwrap();
            clusters.get(cluster_id).map(|c| c.client.clone())
        };
        let client = match existing {
            Some(client) => client,
            None => self.inner.provider.connect(credentials).await?,
        };

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.cfg.queue_cap);
        {
            let mut clusters = self.inner.clusters.lock().unwrap();
            let cluster = clusters
                .entry(cluster_id.to_string())
                .or_insert_with(|| ClusterState::new(client.clone()));
            for kind in &kinds {
                let entry = cluster.kinds.entry(*kind).or_insert_with(KindState::new);
                if let Some(grace) = entry.grace.take() {
                    grace.abort();
                }
                entry.refcount += 1;
                if entry.status == SessionStatus::Idle {
                    entry.status = SessionStatus::Listing;
                    entry.epoch = self.inner.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
                    entry.cancel = CancellationToken::new();
                    session::spawn(
                        Arc::clone(&self.inner),
                        cluster_id.to_string(),
                        *kind,
                        client.clone(),
                        entry.cancel.clone(),
                        entry.epoch,
                    );
                    metrics::counter!("watch_sessions_started_total", 1u64, "kind" => kind.plural());
                }
                if entry.populated {
                    // Fresh channel with capacity >= |kinds|, so this
                    // cannot fail.
                    let snap = snapshot_event(
                        *kind,
                        &entry.cache,
                        entry.last_rv.clone(),
                        namespace.as_deref(),
                    );
                    let _ = tx.try_send(snap);
                }
            }
            cluster.subs.insert(
                id,
                Subscriber { kinds: kinds.clone(), namespace: namespace.clone(), tx },
            );
            metrics::gauge!("watch_subscribers", total_subscribers(&clusters) as f64);
        }
        info!(
            cluster = %cluster_id,
            sub = %id,
            kinds = ?kinds.iter().map(|k| k.plural()).collect::<Vec<_>>(),
            ns = %namespace.as_deref().unwrap_or("(all)"),
            "subscription registered"
        );
        Ok(Subscription {
            id,
            events: rx,
            guard: SubscriptionGuard {
                inner: Arc::downgrade(&self.inner),
                cluster: cluster_id.to_string(),
                id,
                released: false,
            },
        })
    }

    /// Current health rollup for an actively-watched cluster.
    pub fn health(&self, cluster_id: &str) -> Option<HealthSnapshot> {
        let clusters = self.inner.clusters.lock().unwrap();
        clusters.get(cluster_id).map(compute_cluster_health)
    }

    /// Session status for one (cluster, kind); `None` when no session
    /// exists.
    pub fn session_status(&self, cluster_id: &str, kind: ResourceKind) -> Option<SessionStatus> {
        let clusters = self.inner.clusters.lock().unwrap();
        clusters.get(cluster_id).and_then(|c| c.kinds.get(&kind)).map(|k| k.status)
    }
}

fn total_subscribers(clusters: &HashMap<String, ClusterState>) -> usize {
    clusters.values().map(|c| c.subs.len()).sum()
}

impl Inner {
    fn unsubscribe(self: &Arc<Self>, cluster_id: &str, id: Uuid) {
        let mut clusters = self.clusters.lock().unwrap();
        let Some(cluster) = clusters.get_mut(cluster_id) else { return };
        let Some(sub) = cluster.subs.remove(&id) else { return };
        debug!(cluster = %cluster_id, sub = %id, "subscription removed");
        for kind in sub.kinds {
            let Some(entry) = cluster.kinds.get_mut(&kind) else { continue };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                let inner = Arc::clone(self);
                let cluster_name = cluster_id.to_string();
                let epoch = entry.epoch;
                let grace = self.cfg.stop_grace;
                entry.grace = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    inner.stop_kind_if_idle(&cluster_name, kind, epoch);
                }));
            }
        }
        metrics::gauge!("watch_subscribers", total_subscribers(&clusters) as f64);
    }

    /// Grace timer fired: tear the session down unless interest returned.
    fn stop_kind_if_idle(&self, cluster_id: &str, kind: ResourceKind, epoch: u64) {
        let mut clusters = self.clusters.lock().unwrap();
        let Some(cluster) = clusters.get_mut(cluster_id) else { return };
        let Some(entry) = cluster.kinds.get_mut(&kind) else { return };
        if entry.refcount > 0 || entry.epoch != epoch {
            return;
        }
        entry.status = SessionStatus::Stopped;
        entry.cancel.cancel();
        cluster.kinds.remove(&kind);
        metrics::counter!("watch_sessions_stopped_total", 1u64, "kind" => kind.plural());
        info!(cluster = %cluster_id, kind = %kind, "watch session stopped");
        if cluster.kinds.is_empty() && cluster.subs.is_empty() {
            clusters.remove(cluster_id);
            debug!(cluster = %cluster_id, "cluster state dropped");
        }
    }

    pub(crate) fn set_status(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        epoch: u64,
        status: SessionStatus,
    ) {
        let mut clusters = self.clusters.lock().unwrap();
        if let Some(entry) = clusters
            .get_mut(cluster_id)
            .and_then(|c| c.kinds.get_mut(&kind))
        {
            if entry.epoch == epoch {
                entry.status = status;
            }
        }
    }

    /// Wholesale cache replacement after a LIST; emits one SNAPSHOT per
    /// interested subscriber plus a health rollup. Returns false when the
    /// session no longer owns its slot and should exit.
    pub(crate) fn apply_list(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        list: argus_kube::ResourceList,
        epoch: u64,
    ) -> bool {
        let mut clusters = self.clusters.lock().unwrap();
        let Some(cluster) = clusters.get_mut(cluster_id) else { return false };
        let Some(entry) = cluster.kinds.get_mut(&kind) else { return false };
        if entry.epoch != epoch {
            return false;
        }
        entry.cache.clear();
        for raw in list.items {
            let Some(key) = ResourceKey::from_object(&raw) else { continue };
            let resource_version = object_resource_version(&raw).unwrap_or_default().to_string();
            entry
                .cache
                .insert(key.clone(), CachedObject { key, resource_version, raw });
        }
        entry.populated = true;
        entry.last_rv = Some(list.resource_version.clone());
        entry.status = SessionStatus::Streaming;
        metrics::counter!("watch_relists_total", 1u64, "kind" => kind.plural());

        let rv = Some(list.resource_version);
        for sub in cluster.subs.values().filter(|s| s.kinds.contains(&kind)) {
            let snap = snapshot_event(kind, &entry.cache, rv.clone(), sub.namespace.as_deref());
            deliver(sub, snap);
        }
        publish_health(cluster);
        true
    }

    /// Apply one streamed change under the highest-resourceVersion-wins
    /// rule, fan it out, and re-derive health. Returns false when the
    /// session lost its slot.
    pub(crate) fn apply_raw(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        raw: RawWatchEvent,
        epoch: u64,
    ) -> bool {
        let mut clusters = self.clusters.lock().unwrap();
        let Some(cluster) = clusters.get_mut(cluster_id) else { return false };
        let Some(entry) = cluster.kinds.get_mut(&kind) else { return false };
        if entry.epoch != epoch {
            return false;
        }

        let (action, object) = match raw {
            RawWatchEvent::Bookmark { resource_version } => {
                entry.last_rv = Some(resource_version);
                return true;
            }
            RawWatchEvent::Added(object) => (ChangeAction::Added, object),
            RawWatchEvent::Modified(object) => (ChangeAction::Modified, object),
            RawWatchEvent::Deleted(object) => (ChangeAction::Deleted, object),
        };
        let Some(key) = ResourceKey::from_object(&object) else {
            warn!(cluster = %cluster_id, kind = %kind, "change without metadata.name dropped");
            return true;
        };
        let resource_version = object_resource_version(&object).map(|s| s.to_string());

        let accepted = match action {
            ChangeAction::Deleted => entry.cache.remove(&key).is_some(),
            ChangeAction::Added | ChangeAction::Modified => {
                let rv = resource_version.clone().unwrap_or_default();
                let stale = entry
                    .cache
                    .get(&key)
                    .is_some_and(|cur| !supersedes(&rv, &cur.resource_version));
                if stale {
                    false
                } else {
                    entry.cache.insert(
                        key.clone(),
                        CachedObject { key: key.clone(), resource_version: rv, raw: object.clone() },
                    );
                    true
                }
            }
        };
        if !accepted {
            debug!(cluster = %cluster_id, kind = %kind, key = %key, "stale change ignored");
            return true;
        }

        let event = WatchEvent::Change { kind, action, object, resource_version };
        for sub in cluster.subs.values().filter(|s| s.kinds.contains(&kind)) {
            if ns_visible(sub.namespace.as_deref(), key.namespace.as_deref()) {
                deliver(sub, event.clone());
            }
        }
        publish_health(cluster);
        true
    }
}

/// Namespace filter at fan-out time. Cluster-scoped objects are always
/// visible; a filtered subscriber otherwise only sees its own namespace.
fn ns_visible(subscriber_ns: Option<&str>, object_ns: Option<&str>) -> bool {
    match (subscriber_ns, object_ns) {
        (None, _) | (Some(_), None) => true,
        (Some(want), Some(have)) => want == have,
    }
}

fn snapshot_event(
    kind: ResourceKind,
    cache: &FxHashMap<ResourceKey, CachedObject>,
    resource_version: Option<String>,
    namespace: Option<&str>,
) -> WatchEvent {
    let mut entries: Vec<&CachedObject> = cache
        .values()
        .filter(|o| ns_visible(namespace, o.key.namespace.as_deref()))
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    WatchEvent::Snapshot {
        kind,
        objects: entries.into_iter().map(|o| o.raw.clone()).collect(),
        resource_version,
    }
}

fn deliver(sub: &Subscriber, event: WatchEvent) {
    match sub.tx.try_send(event) {
        Ok(()) => {
            metrics::counter!("watch_events_fanout_total", 1u64);
        }
        Err(TrySendError::Full(_)) => {
            // Slow consumer: drop for this subscriber only; a resync
            // snapshot will catch it back up.
            metrics::counter!("watch_events_dropped_total", 1u64);
            warn!("subscriber lagging; event dropped");
        }
        Err(TrySendError::Closed(_)) => {
            // Receiver gone; the guard removes the entry shortly.
        }
    }
}

fn compute_cluster_health(cluster: &ClusterState) -> HealthSnapshot {
    let cache = |kind: ResourceKind| {
        cluster
            .kinds
            .get(&kind)
            .into_iter()
            .flat_map(|k| k.cache.values().map(|o| &o.raw))
    };
    health::compute(
        cache(ResourceKind::Nodes),
        cache(ResourceKind::Pods),
        cache(ResourceKind::Deployments),
        cache(ResourceKind::Events),
    )
}

/// Every kind in the closed set feeds the rollup, so every subscription
/// qualifies to receive it.
fn publish_health(cluster: &ClusterState) {
    let event = WatchEvent::Health { snapshot: compute_cluster_health(cluster) };
    for sub in cluster.subs.values() {
        deliver(sub, event.clone());
    }
}
