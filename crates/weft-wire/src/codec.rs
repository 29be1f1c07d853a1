//! Framed codec for the event stream.
//!
//! Wire format, per frame:
//!
//! ```text
//! [len:4][envelope:len]
//! ```
//!
//! `len` is a big-endian u32 counting the envelope bytes; the envelope is a
//! MessagePack-encoded [`Event`]. Frames larger than [`MAX_FRAME_SIZE`] are
//! rejected before any allocation so a corrupt length prefix cannot make the
//! reader balloon.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::event::Event;

/// Upper bound on one frame's envelope, in bytes.
///
/// State snapshots are the largest messages on the stream; 16 MiB leaves
/// generous headroom for clusters far beyond the design target.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur while framing or unframing events.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The underlying stream failed.
    #[error("stream i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame declared a length beyond [`MAX_FRAME_SIZE`].
    #[error("frame of {declared} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Length declared by the frame header.
        declared: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// The stream ended in the middle of a frame.
    #[error("stream ended mid-frame: expected {expected} more payload bytes")]
    Truncated {
        /// Payload bytes the header promised but the stream never delivered.
        expected: usize,
    },

    /// The envelope could not be encoded.
    #[error("envelope encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The envelope bytes did not decode to an [`Event`].
    #[error("envelope decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Writes one event as a length-prefixed frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the envelope cannot be serialized,
/// [`CodecError::FrameTooLarge`] if it exceeds [`MAX_FRAME_SIZE`], or
/// [`CodecError::Io`] if the stream write fails.
pub async fn write_event<W>(writer: &mut W, event: &Event) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let mut body = Vec::new();
    event.serialize(&mut rmp_serde::Serializer::new(&mut body).with_struct_map())?;

    if body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            declared: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame and decodes the event inside it.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// frames. An EOF inside a frame is reported as [`CodecError::Truncated`].
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] for oversized frames,
/// [`CodecError::Decode`] for malformed envelopes, and [`CodecError::Io`]
/// for transport failures.
pub async fn read_event<R>(reader: &mut R) -> Result<Option<Event>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(CodecError::Io(err)),
    };

    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            declared: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CodecError::Truncated { expected: len });
        }
        Err(err) => return Err(CodecError::Io(err)),
    }

    let event = rmp_serde::from_slice(&body)?;
    Ok(Some(event))
}
