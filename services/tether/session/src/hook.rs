//! Event hook contract.
//!
//! The hook is the only place business logic runs. The session calls it on
//! connect, for every decoded inbound message (on its own task), on pump
//! failure and on close.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::call::{CallTable, PendingCall};
use crate::session::Session;

/// Lifecycle and receive notifications for a session
#[async_trait]
pub trait EventHook<M>: Send + Sync {
    /// Called from `start` before the pumps are spawned.
    ///
    /// Returning `false` declines the connection and closes the session
    /// without reconnecting.
    fn on_connect(&self, _session: &Session<M>) -> bool {
        true
    }

    /// Called once per decoded inbound message.
    ///
    /// Reply correlation happens here: look up the sequence id the protocol
    /// carries with [`InboundMessage::remove_call`] and complete the call.
    /// The lookup is bound to the connection the message arrived on, so a
    /// reply read before a reconnect never completes a newer call.
    async fn on_receive(&self, inbound: InboundMessage<M>, session: Session<M>);

    /// Called exactly once per connection generation when it begins closing
    fn on_close(&self, _session: &Session<M>) {}

    /// Called when a pump stops because of a decode or write failure
    fn on_error(&self, _session: &Session<M>) {}
}

/// A decoded message together with where and when it arrived
pub struct InboundMessage<M> {
    message: M,
    generation: u64,
    received_at: Instant,
    calls: Arc<CallTable<M>>,
}

impl<M> InboundMessage<M> {
    pub(crate) fn new(message: M, generation: u64, calls: Arc<CallTable<M>>) -> Self {
        Self {
            message,
            generation,
            received_at: Instant::now(),
            calls,
        }
    }

    /// Remove the call registered under `seq_id` on the connection this
    /// message was read from
    pub fn remove_call(&self, seq_id: u16) -> Option<PendingCall<M>> {
        self.calls.remove(seq_id)
    }

    /// The decoded message
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Take ownership of the decoded message
    pub fn into_message(self) -> M {
        self.message
    }

    /// Connection generation the message was read from
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the reader pump finished decoding the message
    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

impl<M: Clone> Clone for InboundMessage<M> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            generation: self.generation,
            received_at: self.received_at,
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for InboundMessage<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("message", &self.message)
            .field("generation", &self.generation)
            .field("received_at", &self.received_at)
            .finish_non_exhaustive()
    }
}
