//! Reverse connection acceptor.
//!
//! The engine cannot be told to serve at a time of our choosing, so the roles
//! are inverted: we listen on an ephemeral port, hand that port to whoever
//! launches the engine, and wait for the engine to dial in.
//!
//! Exactly one connection is serviced. After the first accept, the listener
//! moves to a background task that closes every further connection on sight.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::DEFAULT_MAX_FRAME_BUFFER;
use crate::bridge::transport::spawn_transport;
use crate::rpc::{RpcClient, spawn_dispatcher};

#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    #[error("failed to bind {host}: {source}")]
    Bind {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept engine connection: {0}")]
    Accept(#[source] io::Error),
    #[error("an engine connection has already been accepted")]
    AlreadyAccepted,
    #[error("acceptor stopped")]
    Stopped,
}

pub struct ReverseAcceptor {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    max_frame_buffer: usize,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    client: Option<RpcClient>,
}

impl ReverseAcceptor {
    /// Bind an OS-assigned port on `host`.
    pub async fn bind(host: &str) -> Result<Self, AcceptorError> {
        let bind_error = |source| AcceptorError::Bind {
            host: host.to_string(),
            source,
        };
        let listener = TcpListener::bind((host, 0)).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        tracing::info!(%local_addr, "Listening for engine connection");

        Ok(Self {
            listener: Some(listener),
            local_addr,
            max_frame_buffer: DEFAULT_MAX_FRAME_BUFFER,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            client: None,
        })
    }

    pub fn with_max_frame_buffer(mut self, max_frame_buffer: usize) -> Self {
        self.max_frame_buffer = max_frame_buffer;
        self
    }

    /// Address the engine must connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Token that stops every loop owned by this acceptor when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Correlator of the accepted connection, if any.
    pub fn client(&self) -> Option<&RpcClient> {
        self.client.as_ref()
    }

    /// Wait for the engine to connect and layer the correlator on top.
    ///
    /// Cancel-safe: if the future is dropped before a connection arrives, the
    /// listener stays in place and `accept` can be called again.
    pub async fn accept(&mut self) -> Result<RpcClient, AcceptorError> {
        if self.shutdown.is_cancelled() {
            return Err(AcceptorError::Stopped);
        }
        let Some(listener) = self.listener.as_ref() else {
            return Err(AcceptorError::AlreadyAccepted);
        };

        let accepted = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => return Err(AcceptorError::Stopped),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = accepted.map_err(AcceptorError::Accept)?;
        let Some(listener) = self.listener.take() else {
            return Err(AcceptorError::AlreadyAccepted);
        };

        tracing::info!(%peer, "Engine connected");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let parts = spawn_transport(stream, self.max_frame_buffer, self.shutdown.clone());
        let client = RpcClient::new(parts.outbound);
        self.tasks.extend(parts.tasks);
        self.tasks.push(spawn_dispatcher(
            client.clone(),
            parts.inbound,
            self.shutdown.clone(),
        ));
        self.tasks.push(tokio::spawn(reject_extra_connections(
            listener,
            self.shutdown.clone(),
        )));

        self.client = Some(client.clone());
        Ok(client)
    }

    /// Stop all loops, wait for them to exit, then close the listener.
    ///
    /// Safe to call more than once. Requests still waiting for an answer are
    /// abandoned and reported, never awaited.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "Bridge task panicked");
            }
        }
        self.listener = None;

        if let Some(client) = self.client.take() {
            let pending = client.pending_requests();
            if pending > 0 {
                tracing::warn!(
                    pending,
                    "There are {} RPC calls without answer left in queue",
                    pending
                );
            }
        }
        tracing::debug!(local_addr = %self.local_addr, "Acceptor stopped");
    }
}

impl Drop for ReverseAcceptor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn reject_extra_connections(listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::warn!(%peer, "More than one connection from engine, dropping connection");
                    drop(stream);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept extra connection");
                }
            }
        }
    }
    tracing::debug!("Listener closed");
}
