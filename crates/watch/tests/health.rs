use serde_json::{json, Value};

use argus_watch::health;

fn node(ready: bool) -> Value {
    json!({
        "metadata": {"name": "n"},
        "status": {"conditions": [
            {"type": "MemoryPressure", "status": "False"},
            {"type": "Ready", "status": if ready { "True" } else { "False" }}
        ]}
    })
}

fn pod(phase: &str) -> Value {
    json!({"metadata": {"name": "p"}, "status": {"phase": phase}})
}

fn deployment(desired: Option<u64>, ready: Option<u64>) -> Value {
    let mut d = json!({"metadata": {"name": "d"}, "spec": {}, "status": {}});
    if let Some(r) = desired {
        d["spec"]["replicas"] = json!(r);
    }
    if let Some(r) = ready {
        d["status"]["readyReplicas"] = json!(r);
    }
    d
}

fn event(kind: &str) -> Value {
    json!({"metadata": {"name": "e"}, "type": kind, "reason": "Scheduled"})
}

#[test]
fn rollup_counts_follow_cache_contents() {
    let nodes = vec![node(true), node(false), node(true)];
    let pods = vec![
        pod("Running"),
        pod("Running"),
        pod("Pending"),
        pod("Failed"),
        pod("Succeeded"),
    ];
    let deployments = vec![
        deployment(Some(3), Some(3)),
        deployment(Some(2), Some(1)),
        deployment(None, Some(1)), // implicit single replica, ready
    ];
    let events = vec![event("Warning"), event("Normal"), event("Warning")];

    let h = health::compute(nodes.iter(), pods.iter(), deployments.iter(), events.iter());
    assert_eq!((h.nodes_ready, h.nodes_total), (2, 3));
    assert_eq!(h.pods_running, 2);
    assert_eq!(h.pods_pending, 1);
    assert_eq!(h.pods_failed, 1);
    assert_eq!(h.pods_total, 5);
    assert_eq!((h.deployments_healthy, h.deployments_total), (2, 3));
    assert_eq!(h.warning_events, 2);
}

#[test]
fn empty_caches_report_zero_counts_but_unknown_utilization() {
    let h = health::compute(
        std::iter::empty(),
        std::iter::empty(),
        std::iter::empty(),
        std::iter::empty(),
    );
    assert_eq!(h.nodes_total, 0);
    assert_eq!(h.pods_total, 0);
    assert_eq!(h.deployments_total, 0);
    assert_eq!(h.warning_events, 0);
    // Unknown is not zero load.
    assert_eq!(h.cpu_percent, None);
    assert_eq!(h.memory_percent, None);
    assert!(!h.metrics_available);
}

#[test]
fn malformed_objects_never_panic() {
    let nodes = vec![json!({}), json!({"status": {}})];
    let pods = vec![json!({"status": {}}), json!({})];
    let deployments = vec![json!({})];
    let events = vec![json!({}), json!({"type": 7})];

    let h = health::compute(nodes.iter(), pods.iter(), deployments.iter(), events.iter());
    assert_eq!((h.nodes_ready, h.nodes_total), (0, 2));
    assert_eq!(h.pods_total, 2);
    assert_eq!(h.pods_running, 0);
    // No status at all: zero ready replicas against an implicit desired one.
    assert_eq!((h.deployments_healthy, h.deployments_total), (0, 1));
    assert_eq!(h.warning_events, 0);
}
