//! Codec contract and sequence framing for tether sessions.
//!
//! This crate defines the [`Codec`] trait a session uses to turn domain
//! messages into frames and back, plus a stock length-prefixed codec whose
//! frames carry the 16-bit sequence id used for reply correlation.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u16 seq_id           | 0 = uncorrelated           |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;

// Re-export main types
pub use codec::Codec;
pub use error::CodecError;
pub use frame::{
    Frame, FrameCodec, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, FRAME_PREFIX_SIZE, NO_CORRELATION,
};
