//! Reconnecting TCP/TLS client sessions for tether.
//!
//! A session dials one `host:port` target, runs a reader pump and a writer
//! pump over the socket, and hands every decoded inbound message to an
//! [`EventHook`]. Outgoing requests register a [`Call`] under a 16-bit
//! sequence id; the hook completes it when the matching reply arrives.
//!
//! ## Features
//!
//! - **Non-blocking writes**: bounded outbound queue, full means [`Error::WouldBlock`]
//! - **Call correlation**: sequence ids never 0, wrapping back to 1
//! - **Exactly-once close**: concurrent closers wait on a single teardown
//! - **Reconnect**: a fresh generation replaces all per-connection state
//! - **TLS**: optional rustls transport behind the `tls` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use tether_session::{EventHook, InboundMessage, Session, SessionConfig};
//! use tether_wire::{Frame, FrameCodec};
//!
//! struct Replies;
//!
//! #[async_trait]
//! impl EventHook<Frame> for Replies {
//!     async fn on_receive(&self, inbound: InboundMessage<Frame>, _session: Session<Frame>) {
//!         if let Some(call) = inbound.remove_call(inbound.message().seq_id) {
//!             call.complete(inbound.into_message());
//!         }
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SessionConfig::builder()
//!     .codec(FrameCodec::new())
//!     .event_hook(Arc::new(Replies))
//!     .reconnect(true)
//!     .build()?;
//!
//! let session = Session::dial("127.0.0.1:9000", config).await?;
//! session.start();
//!
//! let call = session.register_call()?;
//! session.write(&Frame::new(call.seq_id(), "ping"))?;
//! let reply = call.done().await?;
//! println!("reply: {:?}", reply.payload);
//!
//! session.close(true).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod call;
pub mod config;
pub mod error;
pub mod hook;
mod pump;
mod queue;
pub mod session;
pub mod transport;

// Re-export main types
pub use call::{Call, PendingCall};
pub use config::{
    DispatchOverflow, SessionConfig, SessionConfigBuilder, SharedCodec, DEFAULT_BUFFER_SIZE,
    DEFAULT_DISPATCH_LIMIT, DEFAULT_RECONNECT_INTERVAL,
};
pub use error::{Error, Fault};
pub use hook::{EventHook, InboundMessage};
pub use session::{Lifecycle, Session, SessionStats};
pub use transport::{connect_tcp, open_stream, IoStream, TlsClientConfig};

#[cfg(feature = "tls")]
pub use transport::tls;
