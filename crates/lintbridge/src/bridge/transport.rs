//! Socket tasks for the single engine connection.
//!
//! The connection is split into two halves, each owned by one task:
//! - **reader**: decodes frames and forwards the raw bodies to the dispatcher.
//!   It never waits on message handling, so a slow listener cannot stall it.
//! - **writer**: drains the outbound queue in enqueue order.
//!
//! Both tasks exit at the next await point once the shutdown token fires.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{ContentLengthCodec, FrameError};

pub type InboundFrames = mpsc::UnboundedReceiver<Result<Bytes, FrameError>>;
pub type OutboundQueue = mpsc::UnboundedSender<Bytes>;

/// Channels and task handles for one connected transport.
pub struct TransportParts {
    /// Queue of framed bodies to send, flushed in order by the writer task.
    pub outbound: OutboundQueue,
    /// Complete bodies in arrival order. A terminal `Err` precedes channel close
    /// when the connection failed.
    pub inbound: InboundFrames,
    pub tasks: Vec<JoinHandle<()>>,
}

pub fn spawn_transport(
    stream: TcpStream,
    max_frame_buffer: usize,
    shutdown: CancellationToken,
) -> TransportParts {
    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(
        read_half,
        ContentLengthCodec::with_max_buffer(max_frame_buffer),
    );
    let writer = FramedWrite::new(
        write_half,
        ContentLengthCodec::with_max_buffer(max_frame_buffer),
    );

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let read_task = tokio::spawn(run_reader(reader, inbound_tx, shutdown.clone()));
    let write_task = tokio::spawn(run_writer(writer, outbound_rx, shutdown));

    TransportParts {
        outbound: outbound_tx,
        inbound: inbound_rx,
        tasks: vec![read_task, write_task],
    }
}

async fn run_reader(
    mut reader: FramedRead<OwnedReadHalf, ContentLengthCodec>,
    inbound: mpsc::UnboundedSender<Result<Bytes, FrameError>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            frame = reader.next() => match frame {
                Some(Ok(body)) => {
                    if inbound.send(Ok(body)).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Engine connection failed");
                    let _ = inbound.send(Err(e));
                    break;
                }
                None => {
                    tracing::info!("Engine closed the connection");
                    break;
                }
            }
        }
    }
    tracing::debug!("Reader task exiting");
}

async fn run_writer(
    mut writer: FramedWrite<OwnedWriteHalf, ContentLengthCodec>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        let body = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            body = outbound.recv() => match body {
                Some(body) => body,
                None => break,
            }
        };

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            sent = writer.send(body) => {
                if let Err(e) = sent {
                    tracing::error!(error = %e, "Failed to write frame to engine");
                    break;
                }
            }
        }
    }
    tracing::debug!(dropped = outbound.len(), "Writer task exiting");
}
