//! Length-prefixed frames carrying a correlation sequence id.
//!
//! [`FrameDecoder`] works on an accumulating buffer for callers that read the
//! socket themselves; [`FrameCodec`] implements [`Codec`] directly on top of
//! an `AsyncRead` and is what sessions use.

use crate::codec::Codec;
use crate::error::CodecError;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Maximum frame size (16 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes preceding the payload: u32 length plus u16 sequence id
pub const FRAME_PREFIX_SIZE: usize = 4 + 2;

/// Sequence id of frames that do not answer or expect a reply
pub const NO_CORRELATION: u16 = 0;

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation id, [`NO_CORRELATION`] for events
    pub seq_id: u16,
    /// Opaque payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame answering or expecting a reply for `seq_id`
    pub fn new(seq_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            seq_id,
            payload: payload.into(),
        }
    }

    /// Create an uncorrelated frame
    pub fn event(payload: impl Into<Bytes>) -> Self {
        Self::new(NO_CORRELATION, payload)
    }

    /// Whether the frame carries a correlation id
    pub fn is_correlated(&self) -> bool {
        self.seq_id != NO_CORRELATION
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        FRAME_PREFIX_SIZE + self.payload.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, CodecError> {
        let total_size = self.encoded_size();
        if total_size > max_frame_size {
            return Err(CodecError::FrameTooLarge(total_size));
        }
        let frame_len =
            u32::try_from(total_size - 4).map_err(|_| CodecError::FrameTooLarge(total_size))?;

        let mut buf = BytesMut::with_capacity(total_size);
        buf.put_u32(frame_len);
        buf.put_u16(self.seq_id);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Incremental decoder over an accumulating read buffer
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from a buffer, `Ok(None)` if more bytes are needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        check_frame_len(frame_len, self.max_frame_size)?;

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();
        let seq_id = frame_buf.get_u16();

        Ok(Some(Frame {
            seq_id,
            payload: frame_buf,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn check_frame_len(frame_len: usize, max_frame_size: usize) -> Result<(), CodecError> {
    if frame_len < 2 {
        return Err(CodecError::Malformed);
    }
    if frame_len + 4 > max_frame_size {
        return Err(CodecError::FrameTooLarge(frame_len + 4));
    }
    Ok(())
}

/// Stream codec for [`Frame`]s
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default frame size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Frame size limit applied in both directions
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Codec for FrameCodec {
    type Message = Frame;

    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Frame, CodecError> {
        let frame_len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(CodecError::Closed)
            }
            Err(e) => return Err(e.into()),
        };
        check_frame_len(frame_len, self.max_frame_size)?;

        let mut body = vec![0u8; frame_len];
        reader.read_exact(&mut body).await?;

        let mut body = Bytes::from(body);
        let seq_id = body.get_u16();
        trace!("Decoded frame seq_id={} ({} payload bytes)", seq_id, body.len());

        Ok(Frame {
            seq_id,
            payload: body,
        })
    }

    fn encode(&self, message: &Frame) -> Result<Bytes, CodecError> {
        message.encode(self.max_frame_size)
    }
}
