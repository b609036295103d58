//! Length-prefixed framing.
//!
//! ```text
//! offset 0: u32  type           (big-endian)
//! offset 4: u32  payload_length (big-endian)
//! offset 8: payload_length bytes
//! ```
//!
//! The reader is strict: it knows which message the state machine expects
//! next and treats any other tag as a protocol fault. There is no
//! resynchronization and no out-of-order handling.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, MessageKind};

/// Size of the frame header.
pub const HEADER_LEN: usize = 8;

/// Absolute maximum frame size, header included.
pub const MAX_FRAME_LEN: usize = 1024;

/// Maximum payload a frame may declare.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// A framing or protocol error on the helper connection.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The declared payload length exceeds the frame cap.
    #[error("declared payload length {len} exceeds maximum {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge { len: u32 },

    /// The received tag is not the one the state machine expects here.
    #[error("expected message tag {expected:#06x}, got {got:#06x}")]
    UnexpectedType { expected: u32, got: u32 },

    /// Payload length disagrees with the catalogue for this tag.
    #[error("message {tag:#06x} carried a payload of {len} bytes")]
    BadPayloadLength { tag: u32, len: usize },

    /// A payload field held a value outside its domain.
    #[error("message {tag:#06x} carried invalid field value {value}")]
    BadFieldValue { tag: u32, value: u8 },
}

/// Write one message as a single frame.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = msg.encode_payload();
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&msg.kind().tag().to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one frame and require it to carry `expected`.
///
/// Reads the header, validates the declared length, reads the payload, then
/// checks the tag. A mismatched tag is fatal even if the frame itself is
/// well-formed.
pub async fn read_message<R>(reader: &mut R, expected: MessageKind) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let tag = u32::from_be_bytes(header[..4].try_into().expect("4 bytes"));
    let len = u32::from_be_bytes(header[4..].try_into().expect("4 bytes"));

    if len as usize > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge { len });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    if tag != expected.tag() {
        return Err(FrameError::UnexpectedType {
            expected: expected.tag(),
            got: tag,
        });
    }

    Message::decode_payload(expected, &payload)
}
