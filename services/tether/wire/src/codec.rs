//! The codec contract between a session and its protocol.
//!
//! A session never looks inside a frame. It hands the raw read side of the
//! socket to [`Codec::decode`] and ships whatever bytes [`Codec::encode`]
//! returns, so any framing can be layered on top.

use crate::error::CodecError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

/// Converts domain messages to frames and reads them back off a stream.
///
/// Implementations must be stateless per call: the reader pump may drop a
/// pending `decode` future when the session is cancelled, and the write path
/// calls `encode` from any task.
#[async_trait]
pub trait Codec: Send + Sync {
    /// Domain message carried by this codec
    type Message: Send + 'static;

    /// Read one logically complete message from the stream.
    ///
    /// May suspend until the transport delivers enough bytes.
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Self::Message, CodecError>;

    /// Serialize a message into a single frame
    fn encode(&self, message: &Self::Message) -> Result<Bytes, CodecError>;
}
