//! Scripted stand-in for the analysis engine, used by unit tests.
//!
//! `FakeEngine` dials the acceptor like the real engine does and speaks the
//! same framed JSON-RPC, so tests drive the whole stack over a real socket.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

use crate::acceptor::ReverseAcceptor;
use crate::bridge::codec::ContentLengthCodec;
use crate::rpc::RpcClient;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FakeEngine {
    framed: Framed<TcpStream, ContentLengthCodec>,
}

impl FakeEngine {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, ContentLengthCodec::new()),
        }
    }

    pub async fn recv(&mut self) -> Value {
        self.recv_within(RECV_TIMEOUT)
            .await
            .expect("engine expected a message from the bridge")
    }

    /// Next message, or None if nothing arrives within `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Value> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(body))) => Some(serde_json::from_slice(&body).unwrap()),
            Ok(Some(Err(e))) => panic!("engine read failed: {e}"),
            Ok(None) | Err(_) => None,
        }
    }

    pub async fn expect_request(&mut self, method: &str) -> Value {
        let msg = self.recv().await;
        assert_eq!(msg["method"], method, "unexpected message {msg}");
        assert!(msg.get("id").is_some(), "{method} should be a request");
        msg
    }

    pub async fn expect_notification(&mut self, method: &str) -> Value {
        let msg = self.recv().await;
        assert_eq!(msg["method"], method, "unexpected message {msg}");
        assert!(msg.get("id").is_none(), "{method} should be a notification");
        msg
    }

    pub async fn send(&mut self, message: Value) {
        let body = serde_json::to_vec(&message).unwrap();
        self.framed.send(Bytes::from(body)).await.unwrap();
    }

    pub async fn respond(&mut self, id: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    /// Write bytes straight to the socket, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }
}

/// Acceptor with a fake engine already connected to it.
pub async fn connected() -> (ReverseAcceptor, RpcClient, FakeEngine) {
    let mut acceptor = ReverseAcceptor::bind("127.0.0.1").await.unwrap();
    let engine = FakeEngine::connect(acceptor.local_addr()).await;
    let client = acceptor.accept().await.unwrap();
    (acceptor, client, engine)
}

/// Rule-details command as the engine returns it from a code action.
pub fn rule_command(code: &str) -> Value {
    json!({
        "title": format!("Open description of rule {code}"),
        "command": "SonarLint.OpenRuleDesc",
        "arguments": [
            code,
            format!("Description of {code}"),
            format!("<p>Details for {code}</p>"),
            "CODE_SMELL",
            "MAJOR"
        ]
    })
}

/// In-memory log sink for asserting on emitted tracing events.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CapturedLogs {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    /// Plain-text subscriber writing every event into this sink.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let sink = self.clone();
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .with_writer(move || sink.clone())
            .finish()
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        let buf = self.buf.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}
