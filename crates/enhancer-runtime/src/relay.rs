//! Resolution requests across the privilege boundary.
//!
//! Three layers, leaf first:
//! - the privileged worker answers one-shot [`RelayRequest`]s through a
//!   [`BoundaryPort`] by running the [`Lookup`];
//! - the bridge takes id-tagged [`BridgeRequest`]s off one channel, forwards
//!   each through the port and posts an id-tagged [`BridgeResponse`] back;
//! - [`Relay`] owns the correlation table on the low-privilege side and
//!   matches responses to callers by request id, in whatever order they come.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use enhancer_contracts::{
    BridgeRequest, BridgeResponse, ChannelId, FailureKind, RelayRequest, RelayResponse, RequestId,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::cache::Resolver;
use crate::client::Lookup;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("privileged side is unavailable")]
    Unavailable,
    #[error("boundary torn down before a reply arrived")]
    Dropped,
}

type Envelope = (RelayRequest, oneshot::Sender<RelayResponse>);

/// Sending half of the one-shot boundary primitive.
#[derive(Clone)]
pub struct BoundaryPort {
    tx: mpsc::Sender<Envelope>,
}

impl BoundaryPort {
    pub async fn send(&self, request: RelayRequest) -> Result<RelayResponse, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| TransportError::Unavailable)?;
        reply_rx.await.map_err(|_| TransportError::Dropped)
    }
}

/// Runs lookups on behalf of the low-privilege side, one task per request.
pub fn spawn_privileged_worker(
    lookup: Arc<dyn Lookup>,
    capacity: usize,
) -> (BoundaryPort, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(capacity);
    let handle = tokio::spawn(async move {
        let mut inflight = JoinSet::new();
        loop {
            tokio::select! {
                Some((request, reply)) = rx.recv() => {
                    let lookup = lookup.clone();
                    inflight.spawn(async move {
                        let RelayRequest::Resolve { key } = request;
                        let response = RelayResponse::from_lookup(lookup.lookup(&key).await);
                        if reply.send(response).is_err() {
                            debug!(key = %key, "requester left before the lookup finished");
                        }
                    });
                }
                Some(_) = inflight.join_next() => {}
                else => break,
            }
        }
        debug!("privileged worker stopped");
    });
    (BoundaryPort { tx }, handle)
}

/// Forwards multiplexed requests over the one-shot port. Requests are
/// forwarded concurrently, so responses may come back in any order.
pub fn spawn_bridge(
    port: BoundaryPort,
    mut requests: mpsc::Receiver<BridgeRequest>,
    responses: mpsc::Sender<BridgeResponse>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut inflight = JoinSet::new();
        loop {
            tokio::select! {
                Some(BridgeRequest { request_id, request }) = requests.recv() => {
                    let port = port.clone();
                    let responses = responses.clone();
                    inflight.spawn(async move {
                        let key = request.key().clone();
                        let response = match port.send(request).await {
                            Ok(v) => BridgeResponse::from_relay(request_id, v),
                            Err(err) => {
                                warn!(
                                    request_id = %request_id,
                                    key = %key,
                                    error = %err,
                                    "boundary delivery failed"
                                );
                                BridgeResponse::transport_failure(request_id)
                            }
                        };
                        if responses.send(response).await.is_err() {
                            debug!(request_id = %request_id, "relay gone; response dropped");
                        }
                    });
                }
                Some(_) = inflight.join_next() => {}
                else => break,
            }
        }
        debug!("bridge stopped");
    })
}

struct PendingRequest {
    key: ChannelId,
    issued_at: Instant,
    reply: oneshot::Sender<Option<String>>,
}

#[derive(Default)]
struct RelayCounters {
    resolved: AtomicU64,
    not_found: AtomicU64,
    transport_failures: AtomicU64,
    timeouts: AtomicU64,
}

/// Outcome counts kept apart so "found nothing" and "never got there" can be
/// told apart even though both read as a failed lookup upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayDiagnostics {
    pub resolved: u64,
    pub not_found: u64,
    pub transport_failures: u64,
    pub timeouts: u64,
}

#[derive(Clone)]
pub struct Relay {
    outbound: mpsc::Sender<BridgeRequest>,
    pending: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
    counters: Arc<RelayCounters>,
    request_timeout: Option<Duration>,
}

impl Relay {
    /// Starts the dispatcher that drains `inbound` into the correlation table.
    pub fn spawn(
        outbound: mpsc::Sender<BridgeRequest>,
        inbound: mpsc::Receiver<BridgeResponse>,
        request_timeout: Option<Duration>,
    ) -> (Self, JoinHandle<()>) {
        let relay = Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(RelayCounters::default()),
            request_timeout,
        };
        let dispatcher = tokio::spawn(relay.clone().dispatch(inbound));
        (relay, dispatcher)
    }

    pub async fn call(&self, key: &ChannelId) -> Option<String> {
        let request_id = RequestId::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request_id,
            PendingRequest {
                key: key.clone(),
                issued_at: Instant::now(),
                reply: reply_tx,
            },
        );

        let request = BridgeRequest {
            request_id,
            request: RelayRequest::Resolve { key: key.clone() },
        };
        if self.outbound.send(request).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            self.counters
                .transport_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(request_id = %request_id, key = %key, "transport failure: bridge unavailable");
            return None;
        }

        let reply = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    if self.pending.lock().await.remove(&request_id).is_some() {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            request_id = %request_id,
                            key = %key,
                            timeout_ms = limit.as_millis() as u64,
                            "relay request timed out"
                        );
                    }
                    return None;
                }
            },
            None => reply_rx.await,
        };
        // A dropped reply means the dispatcher already logged the teardown.
        reply.unwrap_or(None)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn diagnostics(&self) -> RelayDiagnostics {
        RelayDiagnostics {
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            not_found: self.counters.not_found.load(Ordering::Relaxed),
            transport_failures: self.counters.transport_failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    async fn dispatch(self, mut inbound: mpsc::Receiver<BridgeResponse>) {
        while let Some(response) = inbound.recv().await {
            let Some(record) = self.pending.lock().await.remove(&response.request_id) else {
                debug!(request_id = %response.request_id, "response for unknown request dropped");
                continue;
            };
            let elapsed_ms = record.issued_at.elapsed().as_millis() as u64;
            let label = if response.success {
                response.label
            } else {
                None
            };
            match (&label, response.failure) {
                (Some(_), _) => {
                    self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        key = %record.key,
                        request_id = %response.request_id,
                        elapsed_ms,
                        "label resolved"
                    );
                }
                (None, Some(FailureKind::Transport)) => {
                    self.counters
                        .transport_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        key = %record.key,
                        request_id = %response.request_id,
                        elapsed_ms,
                        "transport failure: privileged side unreachable"
                    );
                }
                (None, _) => {
                    self.counters.not_found.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        key = %record.key,
                        request_id = %response.request_id,
                        elapsed_ms,
                        "lookup reached the service but found no label"
                    );
                }
            }
            let _ = record.reply.send(label);
        }

        let orphaned: Vec<(RequestId, PendingRequest)> =
            self.pending.lock().await.drain().collect();
        for (request_id, record) in orphaned {
            self.counters
                .transport_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %request_id,
                key = %record.key,
                "transport failure: response channel closed"
            );
            let _ = record.reply.send(None);
        }
    }
}

#[async_trait]
impl Resolver for Relay {
    async fn resolve(&self, key: &ChannelId) -> Option<String> {
        self.call(key).await
    }
}
