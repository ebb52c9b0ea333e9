//! Session configuration.
//!
//! The codec and event hook are required; everything else has a default.
//! Use [`SessionConfig::builder`] to assemble one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_wire::Codec;
use tokio::sync::Semaphore;

use crate::error::Error;
use crate::hook::EventHook;
use crate::transport::TlsClientConfig;

/// Default outbound queue capacity
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Default pause between dial attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
/// Default bound on concurrently running `on_receive` dispatches
pub const DEFAULT_DISPATCH_LIMIT: usize = 256;

/// Shared codec handle for messages of type `M`
pub type SharedCodec<M> = Arc<dyn Codec<Message = M>>;

/// What the reader pump does when every dispatch slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchOverflow {
    /// Stop reading until a dispatch finishes
    #[default]
    Block,
    /// Drop the inbound message and log a warning
    Drop,
}

/// Configuration for a client session
pub struct SessionConfig<M> {
    /// Frame codec
    pub codec: SharedCodec<M>,
    /// Lifecycle and receive notifications
    pub event_hook: Arc<dyn EventHook<M>>,
    /// Outbound queue capacity
    pub buffer_size: usize,
    /// Re-dial after an unforced close
    pub reconnect: bool,
    /// Pause between dial attempts; zero makes a dial failure fatal
    pub reconnect_interval: Duration,
    /// Optional TLS for the transport
    pub tls: Option<TlsClientConfig>,
    /// Maximum concurrent `on_receive` dispatches
    pub dispatch_limit: usize,
    /// Behaviour when `dispatch_limit` is reached
    pub dispatch_overflow: DispatchOverflow,
}

impl<M> Clone for SessionConfig<M> {
    fn clone(&self) -> Self {
        Self {
            codec: Arc::clone(&self.codec),
            event_hook: Arc::clone(&self.event_hook),
            buffer_size: self.buffer_size,
            reconnect: self.reconnect,
            reconnect_interval: self.reconnect_interval,
            tls: self.tls.clone(),
            dispatch_limit: self.dispatch_limit,
            dispatch_overflow: self.dispatch_overflow,
        }
    }
}

impl<M> fmt::Debug for SessionConfig<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("buffer_size", &self.buffer_size)
            .field("reconnect", &self.reconnect)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("tls", &self.tls)
            .field("dispatch_limit", &self.dispatch_limit)
            .field("dispatch_overflow", &self.dispatch_overflow)
            .finish_non_exhaustive()
    }
}

impl<M: Send + 'static> SessionConfig<M> {
    /// Start building a configuration
    pub fn builder() -> SessionConfigBuilder<M> {
        SessionConfigBuilder::default()
    }

    /// Whether a failed dial is retried
    pub fn retries_dial(&self) -> bool {
        !self.reconnect_interval.is_zero()
    }
}

/// Builder for [`SessionConfig`]
pub struct SessionConfigBuilder<M> {
    codec: Option<SharedCodec<M>>,
    event_hook: Option<Arc<dyn EventHook<M>>>,
    buffer_size: usize,
    reconnect: bool,
    reconnect_interval: Duration,
    tls: Option<TlsClientConfig>,
    dispatch_limit: usize,
    dispatch_overflow: DispatchOverflow,
}

impl<M> Default for SessionConfigBuilder<M> {
    fn default() -> Self {
        Self {
            codec: None,
            event_hook: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reconnect: false,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            tls: None,
            dispatch_limit: DEFAULT_DISPATCH_LIMIT,
            dispatch_overflow: DispatchOverflow::default(),
        }
    }
}

impl<M: Send + 'static> SessionConfigBuilder<M> {
    /// Set the frame codec
    pub fn codec<C>(mut self, codec: C) -> Self
    where
        C: Codec<Message = M> + 'static,
    {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Set an already shared codec
    pub fn shared_codec(mut self, codec: SharedCodec<M>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Set the event hook
    pub fn event_hook<H>(mut self, hook: Arc<H>) -> Self
    where
        H: EventHook<M> + 'static,
    {
        self.event_hook = Some(hook);
        self
    }

    /// Outbound queue capacity; zero selects the default
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Re-dial after the connection drops
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    /// Pause between dial attempts; zero disables dial retries
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Wrap the transport in TLS
    pub fn tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Bound concurrent `on_receive` dispatches
    pub fn dispatch_limit(mut self, limit: usize) -> Self {
        self.dispatch_limit = limit;
        self
    }

    /// Choose what happens when all dispatch slots are busy
    pub fn dispatch_overflow(mut self, policy: DispatchOverflow) -> Self {
        self.dispatch_overflow = policy;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<SessionConfig<M>, Error> {
        let codec = self
            .codec
            .ok_or_else(|| Error::Config("unknown codec".to_string()))?;
        let event_hook = self
            .event_hook
            .ok_or_else(|| Error::Config("unknown event hook".to_string()))?;
        if self.dispatch_limit == 0 {
            return Err(Error::Config("dispatch_limit must be positive".to_string()));
        }
        // Both back onto tokio semaphores, which panic above this
        if self.dispatch_limit > Semaphore::MAX_PERMITS {
            return Err(Error::Config(format!(
                "dispatch_limit must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.buffer_size > Semaphore::MAX_PERMITS {
            return Err(Error::Config(format!(
                "buffer_size must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }

        Ok(SessionConfig {
            codec,
            event_hook,
            buffer_size: if self.buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                self.buffer_size
            },
            reconnect: self.reconnect,
            reconnect_interval: self.reconnect_interval,
            tls: self.tls,
            dispatch_limit: self.dispatch_limit,
            dispatch_overflow: self.dispatch_overflow,
        })
    }
}
