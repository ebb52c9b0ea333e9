//! Session error types.

use tether_wire::CodecError;
use thiserror::Error;

/// Session errors
#[derive(Error, Debug)]
pub enum Error {
    /// Outbound queue is full
    #[error("would block")]
    WouldBlock,

    /// Call registration after the session began shutting down
    #[error("client shutdown")]
    Shutdown,

    /// Internal fault on the write path or a closed outbound queue
    #[error("server has been closed")]
    ServerClosed {
        /// Original fault, when one was caught
        #[source]
        cause: Option<Fault>,
    },

    /// Pending call force-completed because the session is tearing down
    #[error("client is closing")]
    ClientClosing,

    /// Codec failed to encode or decode
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Socket level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Dial failed and retrying is disabled
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        /// Dial target
        addr: String,
        /// Last connect error
        #[source]
        source: std::io::Error,
    },

    /// Invalid session configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// TLS setup or handshake failure
    #[error("tls error: {0}")]
    Tls(String),
}

impl Error {
    /// Closed-session error without a recorded cause
    pub fn server_closed() -> Self {
        Error::ServerClosed { cause: None }
    }
}

/// A fault caught at a task or codec boundary, kept as an error source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct Fault(pub String);

impl Fault {
    /// Build a fault from a caught panic payload
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Fault(format!("panic: {s}"))
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Fault(format!("panic: {s}"))
        } else {
            Fault("panic".to_string())
        }
    }
}
