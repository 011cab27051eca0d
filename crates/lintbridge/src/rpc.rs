//! RPC correlator: request ids, response matching and notification fan-out.
//!
//! Flow:
//! 1. `request` allocates the next id, parks a oneshot in the pending table,
//!    then queues the framed body for the writer task
//! 2. The dispatcher task decodes each inbound body and routes it:
//!    responses by id to the pending table, notifications by method name to
//!    every subscribed listener in registration order
//! 3. Requests initiated by the engine are answered with "method not found"
//!    and never touch the pending table
//! 4. The catch-all raw listener (if any) sees every message, last
//!
//! Ids come from a per-client counter, so independent clients never share state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    Incoming, OutgoingErrorResponse, OutgoingMessage, RequestId, ResponseError,
};
use crate::bridge::transport::{InboundFrames, OutboundQueue};

type ResponseSender = oneshot::Sender<Result<Value, ResponseError>>;

/// Listener for one notification method. Receives the `params` member.
pub type NotificationListener = mpsc::UnboundedSender<Value>;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("engine connection closed")]
    ConnectionClosed,
    #[error("failed to encode {method}: {source}")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("engine returned error {code}: {message}")]
    Remote { code: i64, message: String },
}

fn lock_recovering<'a, T>(mutex: &'a StdMutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(registry = what, "Mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

struct RpcInner {
    next_id: AtomicU64,
    pending: DashMap<RequestId, ResponseSender>,
    listeners: StdMutex<HashMap<String, Vec<NotificationListener>>>,
    raw_listener: StdMutex<Option<mpsc::UnboundedSender<Value>>>,
    outbound: OutboundQueue,
    closed: CancellationToken,
}

/// Cloneable handle to the correlator of one engine connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<RpcInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("pending_requests", &self.pending_requests())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClient {
    pub fn new(outbound: OutboundQueue) -> Self {
        Self {
            inner: Arc::new(RpcInner {
                next_id: AtomicU64::new(0),
                pending: DashMap::new(),
                listeners: StdMutex::new(HashMap::new()),
                raw_listener: StdMutex::new(None),
                outbound,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Send a request and wait for its response.
    ///
    /// There is no timeout: a request the engine never answers stays pending
    /// until the connection is torn down, where it is reported as abandoned.
    pub async fn request<P: Serialize>(&self, method: &str, params: P) -> Result<Value, RpcError> {
        let params = encode_params(method, params)?;
        let id = RequestId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let body = OutgoingMessage::request(id, method, params)
            .to_bytes()
            .map_err(|source| RpcError::Encode {
                method: method.to_string(),
                source,
            })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        if self.inner.outbound.send(body).is_err() {
            self.inner.pending.remove(&id);
            return Err(RpcError::ConnectionClosed);
        }
        tracing::debug!(%id, method, "Sent request");

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(RpcError::Remote {
                code: error.code,
                message: error.message,
            }),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Send a fire-and-forget notification.
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), RpcError> {
        let params = encode_params(method, params)?;
        let body = OutgoingMessage::notification(method, params)
            .to_bytes()
            .map_err(|source| RpcError::Encode {
                method: method.to_string(),
                source,
            })?;
        self.inner
            .outbound
            .send(body)
            .map_err(|_| RpcError::ConnectionClosed)?;
        tracing::trace!(method, "Sent notification");
        Ok(())
    }

    /// Register a listener for a notification method.
    ///
    /// Returns false if this channel is already registered for `method`.
    /// Listeners whose receiver has been dropped are pruned on the next
    /// notification.
    pub fn subscribe(&self, method: &str, listener: NotificationListener) -> bool {
        let mut listeners = lock_recovering(&self.inner.listeners, "listeners");
        let registered = listeners.entry(method.to_string()).or_default();
        if registered.iter().any(|existing| existing.same_channel(&listener)) {
            return false;
        }
        registered.push(listener);
        true
    }

    /// Install (or clear) the catch-all listener that sees every decoded message.
    pub fn set_raw_listener(&self, listener: Option<mpsc::UnboundedSender<Value>>) {
        *lock_recovering(&self.inner.raw_listener, "raw_listener") = listener;
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the inbound side of the connection has ended.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.cancel();
    }

    /// Route one decoded body. Never fails: anomalies are logged and dropped.
    pub(crate) fn dispatch(&self, body: &[u8]) {
        let message: Value = match serde_json::from_slice(body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, body_size_bytes = body.len(), "Dropping malformed JSON body");
                return;
            }
        };

        match Incoming::from_value(&message) {
            Ok(Incoming::Response { id, outcome }) => self.complete(id, outcome),
            Ok(Incoming::Request { id, method, .. }) => self.reject_request(id, &method),
            Ok(Incoming::Notification { method, params }) => self.publish(&method, params),
            Err(e) => tracing::warn!(error = %e, "Dropping unroutable message"),
        }

        let mut raw = lock_recovering(&self.inner.raw_listener, "raw_listener");
        if let Some(listener) = raw.as_ref()
            && listener.send(message).is_err()
        {
            *raw = None;
        }
    }

    fn complete(&self, id: RequestId, outcome: Result<Value, ResponseError>) {
        match self.inner.pending.remove(&id) {
            Some((_, tx)) => {
                tracing::debug!(%id, "Received response");
                if tx.send(outcome).is_err() {
                    tracing::debug!(%id, "Requester went away before its response arrived");
                }
            }
            None => {
                tracing::warn!(%id, "Got response for a request that was never sent");
            }
        }
    }

    fn reject_request(&self, id: Value, method: &str) {
        tracing::warn!(%id, method, "Engine sent an unsupported request");
        let reply = match OutgoingErrorResponse::method_not_found(id, method).to_bytes() {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, method, "Failed to encode error reply");
                return;
            }
        };
        if self.inner.outbound.send(reply).is_err() {
            tracing::debug!(method, "Connection closed before error reply could be sent");
        }
    }

    fn publish(&self, method: &str, params: Value) {
        let mut listeners = lock_recovering(&self.inner.listeners, "listeners");
        let Some(registered) = listeners.get_mut(method) else {
            tracing::trace!(method, "No listener for notification");
            return;
        };
        registered.retain(|listener| listener.send(params.clone()).is_ok());
        if registered.is_empty() {
            listeners.remove(method);
        }
    }
}

fn encode_params<P: Serialize>(method: &str, params: P) -> Result<Value, RpcError> {
    serde_json::to_value(params).map_err(|source| RpcError::Encode {
        method: method.to_string(),
        source,
    })
}

/// Spawn the interpretation task that feeds inbound frames to `client`.
///
/// When the inbound stream ends (peer close, I/O error, oversized frame) or
/// `shutdown` fires, the client is marked closed. Pending requests are left
/// in place so teardown can report them.
pub fn spawn_dispatcher(
    client: RpcClient,
    mut inbound: InboundFrames,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                frame = inbound.recv() => match frame {
                    Some(Ok(body)) => client.dispatch(&body),
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Unrecoverable protocol error, abandoning connection");
                        break;
                    }
                    None => break,
                }
            }
        }
        client.mark_closed();
        tracing::debug!(pending = client.pending_requests(), "Dispatcher exiting");
    })
}
