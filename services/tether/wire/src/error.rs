//! Codec error types.

use thiserror::Error;

/// Errors raised while encoding or decoding frames
#[derive(Error, Debug)]
pub enum CodecError {
    /// Underlying stream failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the stream on a frame boundary
    #[error("stream closed by peer")]
    Closed,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    FrameTooLarge(usize),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,

    /// Message could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),
}

impl CodecError {
    /// Whether the error means the peer went away rather than sent garbage
    pub fn is_disconnect(&self) -> bool {
        match self {
            CodecError::Closed => true,
            CodecError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
