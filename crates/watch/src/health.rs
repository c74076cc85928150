//! Derived cluster health: a pure rollup of the node, pod, deployment
//! and event caches. Never panics; empty caches roll up to zero counts
//! and utilization stays unknown rather than zero.

use serde_json::Value;

use argus_core::HealthSnapshot;

/// Re-run after every accepted cache mutation for any of the four kinds.
pub fn compute<'a>(
    nodes: impl Iterator<Item = &'a Value>,
    pods: impl Iterator<Item = &'a Value>,
    deployments: impl Iterator<Item = &'a Value>,
    events: impl Iterator<Item = &'a Value>,
) -> HealthSnapshot {
    let mut health = HealthSnapshot::default();

    for node in nodes {
        health.nodes_total += 1;
        if node_ready(node) {
            health.nodes_ready += 1;
        }
    }

    for pod in pods {
        health.pods_total += 1;
        match pod
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(|p| p.as_str())
        {
            Some("Running") => health.pods_running += 1,
            Some("Pending") => health.pods_pending += 1,
            Some("Failed") => health.pods_failed += 1,
            _ => {}
        }
    }

    for deployment in deployments {
        health.deployments_total += 1;
        if deployment_healthy(deployment) {
            health.deployments_healthy += 1;
        }
    }

    for event in events {
        if event.get("type").and_then(|t| t.as_str()) == Some("Warning") {
            health.warning_events += 1;
        }
    }

    // No utilization source is wired into the sync path; leave cpu/memory
    // unknown instead of reporting zero load.
    health.cpu_percent = None;
    health.memory_percent = None;
    health.metrics_available = false;
    health
}

fn node_ready(raw: &Value) -> bool {
    raw.get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

fn deployment_healthy(raw: &Value) -> bool {
    let desired = raw
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(|r| r.as_u64())
        .unwrap_or(1);
    let ready = raw
        .get("status")
        .and_then(|s| s.get("readyReplicas"))
        .and_then(|r| r.as_u64())
        .unwrap_or(0);
    ready >= desired
}
