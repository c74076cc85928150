//! Argus client: a reconnecting consumer for the dashboard event stream.
//!
//! One [`ClusterStream`] wraps one stream URL in a persistent task that
//! connects, parses SSE frames into typed events, and reconnects with
//! exponential backoff when the transport drops. The transport opening is
//! only a tentative signal; `Connected` is entered when the server's own
//! `status` frame confirms the subscription.

#![forbid(unsafe_code)]

mod parser;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use argus_core::{Backoff, ChangeAction, HealthSnapshot, ResourceKind};

/// Connection lifecycle as observed by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Typed events decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Status {
        watching: Vec<ResourceKind>,
        connected: bool,
        error: Option<String>,
    },
    Ping {
        timestamp: i64,
    },
    Change {
        kind: ResourceKind,
        action: ChangeAction,
        resource: serde_json::Value,
        resource_version: Option<String>,
    },
    Snapshot {
        kind: ResourceKind,
        resources: Vec<serde_json::Value>,
        resource_version: Option<String>,
    },
    Health(HealthSnapshot),
}

#[derive(Debug, thiserror::Error)]
#[error("transport: {0}")]
pub struct TransportError(pub String);

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Transport seam so the reconnect machine is testable without sockets.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, url: &str) -> Result<ByteStream, TransportError>;
}

/// reqwest-backed production transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, url: &str) -> Result<ByteStream, TransportError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(Box::pin(
            response
                .bytes_stream()
                .map_err(|e| TransportError(e.to_string())),
        ))
    }
}

/// Tuning for the reconnect loop; the backoff law matches the server's
/// upstream sessions.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub queue_cap: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            queue_cap: 1024,
        }
    }
}

/// Handle over a running stream consumer. Dropping it (or calling
/// [`ClusterStream::shutdown`]) stops the loop and forbids further
/// reconnects.
pub struct ClusterStream {
    pub events: mpsc::Receiver<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ClusterStream {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Start consuming a stream URL. The loop runs until the handle is shut
/// down or dropped.
pub fn connect(
    url: impl Into<String>,
    transport: Arc<dyn StreamTransport>,
    options: WatchOptions,
) -> ClusterStream {
    let (event_tx, events) = mpsc::channel(options.queue_cap);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(run_loop(url.into(), transport, options, event_tx, state_tx, stop_rx));
    ClusterStream { events, state: state_rx, shutdown: Some(stop_tx) }
}

async fn run_loop(
    url: String,
    transport: Arc<dyn StreamTransport>,
    options: WatchOptions,
    event_tx: mpsc::Sender<ClientEvent>,
    state_tx: watch::Sender<ConnectionState>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut backoff = Backoff::new(options.backoff_base, options.backoff_cap);
    loop {
        let _ = state_tx.send(ConnectionState::Connecting);
        let opened = tokio::select! {
            _ = &mut stop_rx => break,
            res = transport.open(&url) => res,
        };
        match opened {
            Ok(mut stream) => {
                // Transport is up, but only the status frame promotes the
                // state to Connected.
                let mut frames = parser::FrameParser::new();
                loop {
                    let chunk = tokio::select! {
                        _ = &mut stop_rx => {
                            let _ = state_tx.send(ConnectionState::Disconnected);
                            return;
                        }
                        chunk = stream.next() => chunk,
                    };
                    match chunk {
                        Some(Ok(bytes)) => {
                            for frame in frames.push(&bytes) {
                                let Some(event) = parser::decode(&frame) else { continue };
                                match &event {
                                    ClientEvent::Status { connected: true, .. } => {
                                        backoff.reset();
                                        let _ = state_tx.send(ConnectionState::Connected);
                                    }
                                    ClientEvent::Status { connected: false, error, .. } => {
                                        warn!(error = ?error, "server declined the stream");
                                    }
                                    _ => {}
                                }
                                if event_tx.send(event).await.is_err() {
                                    // Consumer gone: stop for good.
                                    let _ = state_tx.send(ConnectionState::Disconnected);
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "stream read failed");
                            break;
                        }
                        None => {
                            debug!("stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
            }
        }
        let _ = state_tx.send(ConnectionState::Disconnected);
        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    let _ = state_tx.send(ConnectionState::Disconnected);
}
