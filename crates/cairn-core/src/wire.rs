//! Cairn wire format: what travels over a peer connection.
//!
//! Every unit on a connection starts with a one-byte frame tag:
//!
//!   0x01  control message: u32 little-endian length, then a JSON Envelope
//!   0x02  raw stream: no further framing bytes
//!
//! The framing layer never knows how long a raw stream is. Every stream is
//! announced by the control message right before it (StoreFile.size or
//! GetFileReply.size). A fetch reply stream also opens with the same size as
//! a u64 little-endian prefix. A reply of size 0 is a miss and carries no
//! stream at all.
//! Changing any of this is a breaking change for every deployed node.

use std::io;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

// ── Frame tags ────────────────────────────────────────────────────────────────

/// A length-prefixed control message follows.
pub const FRAME_MESSAGE: u8 = 0x01;

/// A raw stream follows. Its length is known only to the replication protocol.
pub const FRAME_STREAM: u8 = 0x02;

/// Width of the size prefix that opens a fetch response stream.
pub const STREAM_SIZE_LEN: usize = 8;

/// Default upper bound on a single control message payload.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Default capacity of the transport delivery queue.
pub const DELIVERY_QUEUE_CAPACITY: usize = 1024;

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded unit from a connection.
///
/// A stream frame carries no payload: the bytes after it on the same
/// connection belong to whoever drains the stream, not to the decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Remote address of the connection. Filled in by the transport.
    pub from: String,
    pub payload: Bytes,
    pub stream: bool,
}

impl Frame {
    pub fn message(payload: Bytes) -> Self {
        Self {
            from: String::new(),
            payload,
            stream: false,
        }
    }

    pub fn stream() -> Self {
        Self {
            from: String::new(),
            payload: Bytes::new(),
            stream: true,
        }
    }
}

/// Encode a control message frame: tag, u32 LE length, payload.
pub fn encode_message(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::EnvelopeTooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(1 + 4 + payload.len());
    out.push(FRAME_MESSAGE);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// "I stored a file; its ciphertext follows on this connection."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreIntent {
    /// Namespace the replica belongs to (the writer's NodeID).
    pub node_id: String,
    /// Hashed storage key.
    pub key: String,
    /// Ciphertext length, IV included.
    pub size: u64,
}

/// "Send me this file if you have it."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchIntent {
    /// NodeID of the requester.
    pub node_id: String,
    /// Hashed storage key.
    pub key: String,
    /// Echoed back in the reply. Unique per requester connection.
    pub request_id: u64,
}

/// Answer to one `FetchIntent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReply {
    pub request_id: u64,
    /// Hashed storage key, as requested.
    pub key: String,
    /// Ciphertext length, IV included. 0 = not found, no stream follows.
    pub size: u64,
}

/// The control message carried inside a non-stream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    StoreFile(StoreIntent),
    GetFile(FetchIntent),
    GetFileReply(FetchReply),
    /// Any tag this node does not understand. Ignored by the dispatcher.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode as a complete control frame ready for the socket.
    pub fn to_frame_bytes(&self) -> Result<Vec<u8>, WireError> {
        encode_message(&self.encode()?)
    }
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// Reads one frame from a connection.
///
/// Object safe so the transport can hold any decoder behind an `Arc`.
pub trait Decoder: Send + Sync {
    fn decode<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
    ) -> BoxFuture<'a, Result<Frame, WireError>>;
}

/// The length-prefixed decoder used by every Cairn node.
#[derive(Debug, Clone)]
pub struct DefaultDecoder {
    max_envelope: usize,
}

impl DefaultDecoder {
    pub fn new(max_envelope: usize) -> Self {
        Self { max_envelope }
    }
}

impl Default for DefaultDecoder {
    fn default() -> Self {
        Self::new(MAX_ENVELOPE_SIZE)
    }
}

impl Decoder for DefaultDecoder {
    fn decode<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
    ) -> BoxFuture<'a, Result<Frame, WireError>> {
        Box::pin(async move {
            let tag = reader.read_u8().await?;
            match tag {
                FRAME_STREAM => Ok(Frame::stream()),
                FRAME_MESSAGE => {
                    let len = reader.read_u32_le().await? as usize;
                    if len > self.max_envelope {
                        return Err(WireError::EnvelopeTooLarge(len));
                    }
                    let mut buf = vec![0u8; len];
                    reader.read_exact(&mut buf).await?;
                    Ok(Frame::message(Bytes::from(buf)))
                }
                other => Err(WireError::UnknownFrameType(other)),
            }
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("envelope length {0} exceeds maximum")]
    EnvelopeTooLarge(usize),

    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection read failed: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// True when the remote side simply hung up between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, WireError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
