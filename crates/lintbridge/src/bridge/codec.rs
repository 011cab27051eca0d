//! Header-framed codec for JSON-RPC bodies.
//!
//! Every frame is a block of `Key: Value` lines separated by CRLF, closed by an
//! empty line, followed by exactly `Content-Length` bytes of body:
//!
//! ```text
//! Content-Length: 40\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"initialized"}
//! ```
//!
//! The codec only yields raw bodies. JSON decoding happens on the dispatcher
//! task so that slow message handling never stalls the socket reader.

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default ceiling for a single body and for unparsed buffered bytes (5 MiB).
pub const DEFAULT_MAX_FRAME_BUFFER: usize = 5 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {limit} byte buffer limit")]
    Oversized { size: usize, limit: usize },
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Codec that splits a byte stream on `Content-Length` headers.
///
/// A header whose body has not fully arrived is remembered across calls, so a
/// frame split over any number of reads is reassembled without re-parsing.
#[derive(Debug)]
pub struct ContentLengthCodec {
    body_len: Option<usize>,
    max_buffer: usize,
}

impl Default for ContentLengthCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentLengthCodec {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_FRAME_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            body_len: None,
            max_buffer,
        }
    }

    fn oversized(&self, size: usize) -> FrameError {
        FrameError::Oversized {
            size,
            limit: self.max_buffer,
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Extract the body length from a header block (without its terminator).
fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header = match std::str::from_utf8(header) {
        Ok(header) => header,
        Err(_) => {
            tracing::warn!("Header block is not valid UTF-8");
            return None;
        }
    };

    let mut content_length = None;
    for line in header.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            tracing::warn!(line, "Invalid header line");
            continue;
        };
        if key.trim_end().eq_ignore_ascii_case(CONTENT_LENGTH) {
            match value.trim().parse::<usize>() {
                Ok(len) => content_length = Some(len),
                Err(_) => tracing::warn!(value = value.trim(), "Unparsable Content-Length"),
            }
        }
    }
    content_length
}

impl Decoder for ContentLengthCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let body_len = match self.body_len {
                Some(len) => len,
                None => {
                    let Some(end) = find_header_end(src) else {
                        if src.len() > self.max_buffer {
                            return Err(self.oversized(src.len()));
                        }
                        return Ok(None);
                    };
                    let header = src.split_to(end + HEADER_TERMINATOR.len());
                    match parse_content_length(&header[..end]) {
                        Some(len) if len > self.max_buffer => return Err(self.oversized(len)),
                        Some(len) => {
                            self.body_len = Some(len);
                            len
                        }
                        None => {
                            tracing::warn!(
                                header_size_bytes = end,
                                "Invalid message: no Content-Length header, dropping header"
                            );
                            continue;
                        }
                    }
                }
            };

            if src.len() < body_len {
                src.reserve(body_len - src.len());
                return Ok(None);
            }

            self.body_len = None;
            tracing::trace!(body_size_bytes = body_len, "Decoded frame");
            return Ok(Some(src.split_to(body_len).freeze()));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    tracing::warn!(
                        remaining_bytes = buf.len(),
                        awaiting_body = self.body_len.is_some(),
                        "Connection closed mid-frame"
                    );
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for ContentLengthCodec {
    type Error = FrameError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = body.len();
        tracing::trace!(body_size_bytes = body_len, "Encoding frame");
        if body_len > 100_000 {
            tracing::info!(
                body_size_bytes = body_len,
                body_size_kb = body_len / 1024,
                "Large frame being encoded"
            );
        }

        let header = format!("{CONTENT_LENGTH}: {body_len}\r\n\r\n");
        dst.reserve(header.len() + body_len);
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}
