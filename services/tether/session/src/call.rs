//! Pending-call correlation.
//!
//! A [`Call`] is handed to whoever registered it and resolves once, either
//! with the reply the event hook matched to its sequence id or with the error
//! the session used to tear itself down. The table keeps the completing half
//! ([`PendingCall`]) keyed by sequence id.

use std::collections::HashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;

type Outcome<M> = Result<M, Error>;

/// Caller side of an outstanding request
#[derive(Debug)]
pub struct Call<M> {
    seq_id: u16,
    generation: u64,
    done: oneshot::Receiver<Outcome<M>>,
}

impl<M> Call<M> {
    /// Sequence id to embed in the outgoing request
    pub fn seq_id(&self) -> u16 {
        self.seq_id
    }

    /// Connection generation whose table holds this call
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the reply or the error that terminated the call
    pub async fn done(self) -> Result<M, Error> {
        match self.done.await {
            Ok(outcome) => outcome,
            // Completing half dropped without an outcome: the table is gone
            Err(_) => Err(Error::ClientClosing),
        }
    }

    /// Check for an outcome without waiting
    pub fn try_outcome(&mut self) -> Option<Result<M, Error>> {
        match self.done.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::ClientClosing)),
        }
    }
}

/// Completing side of an outstanding request, owned by the call table
#[derive(Debug)]
pub struct PendingCall<M> {
    seq_id: u16,
    done: oneshot::Sender<Outcome<M>>,
}

impl<M> PendingCall<M> {
    /// Sequence id this call was registered under
    pub fn seq_id(&self) -> u16 {
        self.seq_id
    }

    /// Deliver the reply; returns false if the caller stopped waiting
    pub fn complete(self, reply: M) -> bool {
        self.done.send(Ok(reply)).is_ok()
    }

    /// Deliver an error; returns false if the caller stopped waiting
    pub fn fail(self, err: Error) -> bool {
        self.done.send(Err(err)).is_ok()
    }
}

struct TableState<M> {
    pending: HashMap<u16, PendingCall<M>>,
    next_seq: u16,
    closing: bool,
}

impl<M> TableState<M> {
    fn allocate_seq(&mut self) -> u16 {
        let seq_id = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        // 0 means "no correlation"
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        seq_id
    }
}

/// Sequence allocation plus the map of outstanding calls
pub(crate) struct CallTable<M> {
    generation: u64,
    state: Mutex<TableState<M>>,
}

impl<M> CallTable<M> {
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            generation,
            state: Mutex::new(TableState {
                pending: HashMap::new(),
                next_seq: 1,
                closing: false,
            }),
        }
    }

    /// Register a new call, failing once the table is closing
    pub(crate) fn register(&self) -> Result<Call<M>, Error> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(Error::Shutdown);
        }

        let seq_id = state.allocate_seq();
        let (tx, rx) = oneshot::channel();
        if let Some(stale) = state.pending.insert(seq_id, PendingCall { seq_id, done: tx }) {
            debug!("Sequence id {} reused while still pending", stale.seq_id);
        }

        Ok(Call {
            seq_id,
            generation: self.generation,
            done: rx,
        })
    }

    /// Remove the call registered under `seq_id`, if any
    pub(crate) fn remove(&self, seq_id: u16) -> Option<PendingCall<M>> {
        self.state.lock().pending.remove(&seq_id)
    }

    /// Flip the closing flag; returns the previous value
    pub(crate) fn set_closing(&self, closing: bool) -> bool {
        std::mem::replace(&mut self.state.lock().closing, closing)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    /// Fail every outstanding call; returns how many were terminated.
    ///
    /// The caller must hold the session's send lock.
    pub(crate) fn terminate_all(&self, make_err: impl Fn() -> Error) -> usize {
        let mut state = self.state.lock();
        let terminated = state.pending.len();
        for (_, call) in state.pending.drain() {
            call.fail(make_err());
        }
        terminated
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[cfg(test)]
    fn set_next_seq(&self, next_seq: u16) {
        self.state.lock().next_seq = next_seq;
    }
}
