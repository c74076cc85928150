//! Incremental parser for the SSE wire framing, and the decoding of
//! framed payloads into typed events. Malformed payloads are dropped per
//! event; they never kill the connection.

use serde_json::Value;
use tracing::warn;

use argus_core::{ChangeAction, ResourceKind};

use crate::ClientEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub event: String,
    pub data: String,
}

/// Accumulates transport chunks into blank-line-terminated frames.
/// Chunk boundaries may fall anywhere, including inside a UTF-8 rune.
#[derive(Debug, Default)]
pub(crate) struct FrameParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if self.event.is_some() || !self.data.is_empty() {
                    frames.push(Frame {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // comment / keepalive filler
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {} // id/retry unused
            }
        }
        frames
    }
}

/// Decode one frame into a typed event; `None` for malformed payloads or
/// unknown event names.
pub(crate) fn decode(frame: &Frame) -> Option<ClientEvent> {
    let payload: Value = match serde_json::from_str(&frame.data) {
        Ok(v) => v,
        Err(e) => {
            warn!(event = %frame.event, error = %e, "malformed payload dropped");
            return None;
        }
    };
    match frame.event.as_str() {
        "status" => {
            let connected = payload.get("connected").and_then(|v| v.as_bool())?;
            let watching = payload
                .get("watching")
                .and_then(|v| v.as_array())
                .map(|names| {
                    names
                        .iter()
                        .filter_map(|n| n.as_str())
                        .filter_map(|n| n.parse::<ResourceKind>().ok())
                        .collect()
                })
                .unwrap_or_default();
            let error = payload
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Some(ClientEvent::Status { watching, connected, error })
        }
        "ping" => {
            let timestamp = payload.get("timestamp").and_then(|v| v.as_i64())?;
            Some(ClientEvent::Ping { timestamp })
        }
        "health" => {
            let snapshot = serde_json::from_value(payload.get("resource")?.clone()).ok()?;
            Some(ClientEvent::Health(snapshot))
        }
        name => {
            let action = payload.get("action").and_then(|v| v.as_str())?;
            let resource_version = payload
                .get("resourceVersion")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            if let Some(kind) = ResourceKind::from_singular(name) {
                let action: ChangeAction = action.parse().ok()?;
                let resource = payload.get("resource")?.clone();
                return Some(ClientEvent::Change { kind, action, resource, resource_version });
            }
            if let Ok(kind) = name.parse::<ResourceKind>() {
                if action != "SNAPSHOT" {
                    return None;
                }
                let resources = payload.get("resource")?.as_array()?.clone();
                return Some(ClientEvent::Snapshot { kind, resources, resource_version });
            }
            warn!(event = %name, "unknown event name dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_survive_arbitrary_chunking() {
        let wire = "event: pod\ndata: {\"a\":1}\n\nevent: ping\ndata: {\"t\":2}\n\n";
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        // Feed one byte at a time.
        for b in wire.as_bytes() {
            frames.extend(parser.push(&[*b]));
        }
        assert_eq!(
            frames,
            vec![
                Frame { event: "pod".into(), data: "{\"a\":1}".into() },
                Frame { event: "ping".into(), data: "{\"t\":2}".into() },
            ]
        );
    }

    #[test]
    fn crlf_comments_and_multiline_data_are_handled() {
        let wire = "event: status\r\ndata: {\"connected\":\r\ndata: true}\r\n: keepalive\r\n\r\n";
        let mut parser = FrameParser::new();
        let frames = parser.push(wire.as_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "status");
        assert_eq!(frames[0].data, "{\"connected\":\ntrue}");
    }

    #[test]
    fn event_name_defaults_to_message() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b"data: hi\n\n");
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn decode_dispatches_singular_plural_and_derived_names() {
        let change = Frame {
            event: "deployment".into(),
            data: r#"{"action":"ADDED","resource":{"metadata":{"name":"api"}},"resourceVersion":"7"}"#.into(),
        };
        match decode(&change) {
            Some(ClientEvent::Change { kind, action, resource_version, .. }) => {
                assert_eq!(kind, ResourceKind::Deployments);
                assert_eq!(action, ChangeAction::Added);
                assert_eq!(resource_version.as_deref(), Some("7"));
            }
            other => panic!("unexpected decode: {other:?}"),
        }

        let snapshot = Frame {
            event: "pods".into(),
            data: r#"{"action":"SNAPSHOT","resource":[{"metadata":{"name":"web-1"}}]}"#.into(),
        };
        match decode(&snapshot) {
            Some(ClientEvent::Snapshot { kind, resources, .. }) => {
                assert_eq!(kind, ResourceKind::Pods);
                assert_eq!(resources.len(), 1);
            }
            other => panic!("unexpected decode: {other:?}"),
        }

        let health = Frame {
            event: "health".into(),
            data: r#"{"action":"SNAPSHOT","resource":{"nodesReady":1,"nodesTotal":2,"podsRunning":0,"podsPending":0,"podsFailed":0,"podsTotal":0,"deploymentsHealthy":0,"deploymentsTotal":0,"warningEvents":0,"cpuPercent":null,"memoryPercent":null,"metricsAvailable":false}}"#.into(),
        };
        match decode(&health) {
            Some(ClientEvent::Health(snapshot)) => {
                assert_eq!(snapshot.nodes_ready, 1);
                assert_eq!(snapshot.cpu_percent, None);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn malformed_payloads_are_swallowed() {
        assert_eq!(decode(&Frame { event: "pod".into(), data: "{not json".into() }), None);
        assert_eq!(decode(&Frame { event: "pod".into(), data: "{}".into() }), None);
        assert_eq!(
            decode(&Frame { event: "replicaset".into(), data: "{\"action\":\"ADDED\"}".into() }),
            None
        );
        // Wrong shape for a snapshot name.
        assert_eq!(
            decode(&Frame {
                event: "pods".into(),
                data: r#"{"action":"ADDED","resource":[]}"#.into()
            }),
            None
        );
    }
}
