//! Bounded outbound frame queue.
//!
//! Producers never wait: a full queue is reported as [`Error::WouldBlock`].
//! The single consumer is the writer pump, which takes the receiving half
//! when the session starts.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::Error;

pub(crate) struct OutboundQueue {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    capacity: usize,
}

impl OutboundQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
        }
    }

    /// Enqueue without waiting for space
    pub(crate) fn try_enqueue(&self, frame: Bytes) -> Result<(), Error> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::WouldBlock),
            Err(TrySendError::Closed(_)) => Err(Error::server_closed()),
        }
    }

    /// Hand the consuming half to the writer pump
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.rx.lock().take()
    }

    /// Refuse further frames if the writer pump never took the queue
    pub(crate) fn close(&self) {
        if let Some(mut rx) = self.rx.lock().take() {
            rx.close();
        }
    }

    /// Frames waiting to be written
    pub(crate) fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
