//! JSON-RPC 2.0 envelopes and the LSP payloads exchanged with the engine.
//!
//! Outbound traffic is built from [`OutgoingMessage`]; inbound bodies are
//! classified into [`Incoming`] by the presence of `id` and `method`:
//! - `id` without `method`: a response, matched against the pending request table
//! - `id` with `method`: an engine-initiated request, answered with an error
//! - `method` without `id`: a notification, fanned out to listeners

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::bytes::Bytes;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for a method the receiver does not implement.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Method names used on the engine connection.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const DID_OPEN: &str = "textDocument/didOpen";
    pub const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
    pub const CODE_ACTION: &str = "textDocument/codeAction";
}

/// Request identifier, unique for the lifetime of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message from the bridge to the engine.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    method: String,
    params: Value,
}

impl OutgoingMessage {
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Compact JSON body, ready for framing.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Error response from the bridge to an engine-initiated request.
///
/// The id is echoed verbatim; engines may use strings as well as numbers.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingErrorResponse {
    jsonrpc: &'static str,
    id: Value,
    error: ResponseError,
}

impl OutgoingErrorResponse {
    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            error: ResponseError {
                code: METHOD_NOT_FOUND,
                message: format!("Unhandled method {method}"),
                data: None,
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON-RPC message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported message id {0}")]
    InvalidId(Value),
    #[error("message has neither id nor method")]
    Unclassified,
}

/// Message from the engine to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: RequestId,
        outcome: Result<Value, ResponseError>,
    },
    /// Request issued by the engine. Its id lives in the engine's own id
    /// space and never refers to a pending bridge request.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

impl Incoming {
    pub fn from_value(message: &Value) -> Result<Self, ProtocolError> {
        let raw = RawMessage::deserialize(message)?;

        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Self::Request {
                id,
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (Some(id), None) => {
                let id = match id.as_u64() {
                    Some(id) => RequestId(id),
                    None => return Err(ProtocolError::InvalidId(id)),
                };
                let outcome = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, Some(method)) => Ok(Self::Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (None, None) => Err(ProtocolError::Unclassified),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// Rule code of a diagnostic; engines send either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiagnosticCode {
    Number(i64),
    String(String),
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// One reported issue. Fields the bridge does not interpret are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<DiagnosticCode>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Diagnostic {
    /// Key used for rule metadata lookups.
    pub fn rule_key(&self) -> Option<String> {
        self.code.as_ref().map(ToString::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentItem {
    pub uri: String,
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidOpenTextDocumentParams {
    pub text_document: TextDocumentItem,
}
