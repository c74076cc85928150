//! The SSE bridge: one watch subscription per streaming connection.
//!
//! This module owns the only mapping from [`WatchEvent`] variants to wire
//! event names. Subscription teardown rides the stream's drop, so every
//! exit path (client abort, write failure, clean end) releases upstream
//! interest exactly once.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use argus_core::{ResourceKind, WatchEvent};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct StreamParams {
    resources: Option<String>,
    namespace: Option<String>,
}

/// Comma-separated kind list; unknown entries are dropped, absence means
/// the full closed set.
fn parse_kinds(raw: Option<&str>) -> Vec<ResourceKind> {
    let Some(csv) = raw else {
        return ResourceKind::ALL.to_vec();
    };
    let mut kinds = Vec::new();
    for token in csv.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse::<ResourceKind>() {
            Ok(kind) => {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
            Err(_) => debug!(kind = %token, "ignoring unknown resource kind"),
        }
    }
    kinds
}

/// Wire frame for one event: name plus JSON payload.
fn frame_parts(event: &WatchEvent) -> (&'static str, String) {
    let (name, payload) = match event {
        WatchEvent::Change { kind, action, object, resource_version } => {
            let mut payload = json!({ "action": action, "resource": object });
            if let Some(rv) = resource_version {
                payload["resourceVersion"] = json!(rv);
            }
            (kind.singular(), payload)
        }
        WatchEvent::Snapshot { kind, objects, resource_version } => {
            let mut payload = json!({ "action": "SNAPSHOT", "resource": objects });
            if let Some(rv) = resource_version {
                payload["resourceVersion"] = json!(rv);
            }
            (kind.plural(), payload)
        }
        WatchEvent::Health { snapshot } => {
            ("health", json!({ "action": "SNAPSHOT", "resource": snapshot }))
        }
    };
    (name, payload.to_string())
}

fn event_frame(event: &WatchEvent) -> Event {
    let (name, data) = frame_parts(event);
    Event::default().event(name).data(data)
}

fn status_data(watching: &[&'static str], connected: bool, error: Option<&str>) -> String {
    let mut payload = json!({ "watching": watching, "connected": connected });
    if let Some(err) = error {
        payload["error"] = json!(err);
    }
    payload.to_string()
}

fn status_event(watching: &[&'static str], connected: bool, error: Option<&str>) -> Event {
    Event::default()
        .event("status")
        .data(status_data(watching, connected, error))
}

fn ping_event() -> Event {
    let data = json!({ "timestamp": chrono::Utc::now().timestamp_millis() });
    Event::default().event("ping").data(data.to_string())
}

pub(crate) async fn cluster_health(
    Path(cluster): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.manager.health(&cluster) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_FOUND, "cluster not watched").into_response(),
    }
}

pub(crate) async fn stream(
    Path(cluster): Path<String>,
    Query(params): Query<StreamParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let kinds = parse_kinds(params.resources.as_deref());
    if kinds.is_empty() {
        return (StatusCode::BAD_REQUEST, "no valid resource kinds requested").into_response();
    }
    let namespace = params.namespace.filter(|ns| !ns.is_empty());
    let keepalive = state.keepalive;
    let watching: Vec<&'static str> = kinds.iter().map(|k| k.plural()).collect();

    // Subscribe before the response stream starts, so a failure becomes a
    // terminal status frame rather than a broken transport.
    let outcome = match state.registry.lookup(&cluster) {
        Some(credentials) => state
            .manager
            .subscribe(&cluster, &credentials, &kinds, namespace)
            .await
            .map_err(|e| e.to_string()),
        None => Err(format!("unknown cluster: {cluster}")),
    };

    let stream = async_stream::stream! {
        match outcome {
            Ok(mut sub) => {
                debug!(cluster = %cluster, sub = %sub.id, "stream opened");
                yield Ok::<Event, Infallible>(status_event(&watching, true, None));
                let mut ticker = tokio::time::interval(keepalive);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // the immediate first tick
                loop {
                    tokio::select! {
                        event = sub.events.recv() => match event {
                            Some(event) => yield Ok(event_frame(&event)),
                            None => break,
                        },
                        _ = ticker.tick() => yield Ok(ping_event()),
                    }
                }
                debug!(cluster = %cluster, sub = %sub.id, "stream closing");
                sub.unsubscribe();
            }
            Err(error) => {
                warn!(cluster = %cluster, error = %error, "stream subscribe failed");
                yield Ok(status_event(&watching, false, Some(&error)));
            }
        }
    };
    let mut response = Sse::new(stream).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::{ChangeAction, HealthSnapshot};

    #[test]
    fn kind_list_defaults_to_all_and_drops_unknowns() {
        assert_eq!(parse_kinds(None), ResourceKind::ALL.to_vec());
        assert_eq!(
            parse_kinds(Some("pods, nodes ,replicasets")),
            vec![ResourceKind::Pods, ResourceKind::Nodes]
        );
        assert_eq!(
            parse_kinds(Some("pods,pods")),
            vec![ResourceKind::Pods],
            "duplicates collapse"
        );
        assert!(parse_kinds(Some("replicasets,secrets")).is_empty());
        assert!(parse_kinds(Some("")).is_empty());
    }

    #[test]
    fn change_frames_use_singular_names() {
        let event = WatchEvent::Change {
            kind: ResourceKind::Pods,
            action: ChangeAction::Modified,
            object: json!({"metadata": {"name": "web-1"}}),
            resource_version: Some("42".into()),
        };
        let (name, data) = frame_parts(&event);
        assert_eq!(name, "pod");
        let payload: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(payload["action"], "MODIFIED");
        assert_eq!(payload["resource"]["metadata"]["name"], "web-1");
        assert_eq!(payload["resourceVersion"], "42");
    }

    #[test]
    fn snapshot_frames_use_plural_names_and_omit_missing_cursor() {
        let event = WatchEvent::Snapshot {
            kind: ResourceKind::Nodes,
            objects: vec![json!({"metadata": {"name": "worker-0"}})],
            resource_version: None,
        };
        let (name, data) = frame_parts(&event);
        assert_eq!(name, "nodes");
        let payload: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(payload["action"], "SNAPSHOT");
        assert_eq!(payload["resource"].as_array().unwrap().len(), 1);
        assert!(payload.get("resourceVersion").is_none());
    }

    #[test]
    fn health_frames_carry_the_rollup() {
        let event = WatchEvent::Health {
            snapshot: HealthSnapshot { nodes_ready: 2, nodes_total: 3, ..Default::default() },
        };
        let (name, data) = frame_parts(&event);
        assert_eq!(name, "health");
        let payload: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(payload["resource"]["nodesReady"], 2);
        assert_eq!(payload["resource"]["metricsAvailable"], false);
    }

    #[test]
    fn status_payload_carries_error_only_when_present() {
        let ok: serde_json::Value =
            serde_json::from_str(&status_data(&["pods"], true, None)).unwrap();
        assert_eq!(ok["connected"], true);
        assert_eq!(ok["watching"][0], "pods");
        assert!(ok.get("error").is_none());

        let failed: serde_json::Value =
            serde_json::from_str(&status_data(&["pods"], false, Some("boom"))).unwrap();
        assert_eq!(failed["connected"], false);
        assert_eq!(failed["error"], "boom");
    }
}
