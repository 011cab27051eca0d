//! Wire layer for the engine connection.
//!
//! # Architecture
//!
//! - **codec**: `Content-Length` header framing for AsyncRead/AsyncWrite
//! - **protocol**: JSON-RPC 2.0 envelopes and the LSP payloads the bridge uses
//! - **transport**: reader/writer tasks that own the socket halves

pub mod codec;
pub mod protocol;
pub mod transport;
