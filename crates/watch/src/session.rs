//! Upstream watch session: the per-(cluster, kind) list/stream/retry
//! loop.
//!
//! Listing replaces the cache wholesale and emits a snapshot; Streaming
//! relays deltas from the recorded resourceVersion; a stream that ends
//! cleanly relists immediately (the server rotates watches as a matter of
//! course), while a true error backs off before the next attempt.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use argus_core::{Backoff, ResourceKind};
use argus_kube::ClusterClient;

use crate::{Inner, SessionStatus};

pub(crate) fn spawn(
    inner: Arc<Inner>,
    cluster_id: String,
    kind: ResourceKind,
    client: Arc<dyn ClusterClient>,
    cancel: CancellationToken,
    epoch: u64,
) {
    tokio::spawn(run(inner, cluster_id, kind, client, cancel, epoch));
}

async fn run(
    inner: Arc<Inner>,
    cluster_id: String,
    kind: ResourceKind,
    client: Arc<dyn ClusterClient>,
    cancel: CancellationToken,
    epoch: u64,
) {
    info!(cluster = %cluster_id, kind = %kind, "watch session starting");
    let mut backoff = Backoff::new(inner.cfg.backoff_base, inner.cfg.backoff_cap);
    loop {
        if cancel.is_cancelled() {
            break;
        }
        inner.set_status(&cluster_id, kind, epoch, SessionStatus::Listing);
        let listed = tokio::select! {
            _ = cancel.cancelled() => break,
            res = client.list(kind) => res,
        };
        let resource_version = match listed {
            Ok(list) => {
                let rv = list.resource_version.clone();
                if !inner.apply_list(&cluster_id, kind, list, epoch) {
                    break;
                }
                backoff.reset();
                rv
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    cluster = %cluster_id,
                    kind = %kind,
                    error = %e,
                    backoff_ms = delay.as_millis() as u64,
                    "list failed; backing off"
                );
                inner.set_status(&cluster_id, kind, epoch, SessionStatus::Retrying);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            res = client.watch(kind, &resource_version) => res,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    cluster = %cluster_id,
                    kind = %kind,
                    error = %e,
                    backoff_ms = delay.as_millis() as u64,
                    "watch open failed; backing off"
                );
                inner.set_status(&cluster_id, kind, epoch, SessionStatus::Retrying);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        let mut failed = false;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(cluster = %cluster_id, kind = %kind, "watch session cancelled mid-stream");
                    return;
                }
                item = stream.next() => item,
            };
            match item {
                None => {
                    // Server closed the watch: resync via a fresh list.
                    debug!(cluster = %cluster_id, kind = %kind, "watch stream ended; relisting");
                    break;
                }
                Some(Ok(raw)) => {
                    if !inner.apply_raw(&cluster_id, kind, raw, epoch) {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(cluster = %cluster_id, kind = %kind, error = %e, "watch stream failed");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            let delay = backoff.next_delay();
            inner.set_status(&cluster_id, kind, epoch, SessionStatus::Retrying);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            backoff.reset();
        }
    }
    debug!(cluster = %cluster_id, kind = %kind, "watch session exited");
}
