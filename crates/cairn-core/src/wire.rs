//! cairn wire format: everything that travels over a peer connection.
//!
//! Every frame starts with a single tag byte:
//!
//! ```text
//! MESSAGE (0x01): [u32 BE length][JSON Message]
//! STREAM  (0x02): raw bytes follow, count agreed by the preceding MESSAGE
//! ```
//!
//! The transport decodes MESSAGE frames itself and hands the JSON to the
//! replication layer. It never looks past a STREAM tag: those bytes are read
//! straight off the socket by whoever owns the stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Tags ──────────────────────────────────────────────────────────────────────

/// Control frame carrying a length-prefixed, serialized `Message`.
pub const TAG_MESSAGE: u8 = 0x01;

/// Stream marker. Raw application bytes follow.
pub const TAG_STREAM: u8 = 0x02;

/// Upper bound on a control frame body. Control messages are a key and a
/// size, so anything near this is a corrupt or hostile peer.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

// ── Message ───────────────────────────────────────────────────────────────────

/// Replication control envelope.
///
/// Constructed per call, serialized, sent, and dropped. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    /// The sender is about to stream exactly `size` bytes to be stored
    /// under `key`. `reply` marks the answer to one of our own `GetFile`s;
    /// it is omitted from the JSON when false.
    StoreFile {
        key: String,
        size: u64,
        #[serde(default, skip_serializing_if = "is_false")]
        reply: bool,
    },

    /// The sender wants the content stored under `key`.
    GetFile { key: String },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Message {
    pub fn key(&self) -> &str {
        match self {
            Message::StoreFile { key, .. } | Message::GetFile { key } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One tagged unit read off a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Body of a MESSAGE frame, still serialized.
    Message(Bytes),
    /// A STREAM marker. Nothing has been read past the tag.
    Stream,
}

/// Read one frame.
///
/// The body of a MESSAGE frame is accumulated with `read_exact`, so a frame
/// split across several TCP segments is still read whole.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = reader.read_u8().await?;
    match tag {
        TAG_MESSAGE => {
            let len = reader.read_u32().await? as usize;
            if len > MAX_CONTROL_FRAME {
                return Err(WireError::FrameTooLarge(len));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            Ok(Frame::Message(Bytes::from(body)))
        }
        TAG_STREAM => Ok(Frame::Stream),
        other => Err(WireError::UnknownTag(other)),
    }
}

/// Build a complete MESSAGE frame around an already-serialized body.
pub fn message_frame(body: &[u8]) -> Result<Vec<u8>, WireError> {
    if body.len() > MAX_CONTROL_FRAME {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(1 + 4 + body.len());
    frame.push(TAG_MESSAGE);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Write a MESSAGE frame in a single `write_all`.
pub async fn write_message<W>(writer: &mut W, body: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = message_frame(body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("connection closed")]
    Closed,

    #[error("unknown frame tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("control frame length {0} exceeds maximum {}", MAX_CONTROL_FRAME)]
    FrameTooLarge(usize),

    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(e)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
