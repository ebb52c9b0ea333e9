//! Reader and writer pumps.
//!
//! Each running generation has exactly one of each. Both leave on the
//! generation's cancellation token, report their exit, then close the
//! generation themselves so a dead socket on either side tears the whole
//! generation down.

use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{BufReader, ReadHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::DispatchOverflow;
use crate::error::Fault;
use crate::hook::InboundMessage;
use crate::session::{Generation, Session};
use crate::transport::IoStream;

pub(crate) async fn reader_pump<M: Send + 'static>(
    session: Session<M>,
    generation: Arc<Generation<M>>,
    reader: ReadHalf<IoStream>,
) {
    let outcome = AssertUnwindSafe(read_loop(&session, &generation, reader))
        .catch_unwind()
        .await;
    if let Err(panic) = outcome {
        let fault = Fault::from_panic(panic.as_ref());
        error!(
            "Reader pump for generation {} panicked: {}",
            generation.id, fault
        );
    }

    debug!("Reader pump for generation {} exited", generation.id);
    generation.pump_exited();
    generation.close(&session, false).await;
}

async fn read_loop<M: Send + 'static>(
    session: &Session<M>,
    generation: &Arc<Generation<M>>,
    reader: ReadHalf<IoStream>,
) {
    let config = &session.shared.config;
    let mut reader = BufReader::new(reader);

    loop {
        let decoded = tokio::select! {
            biased;
            _ = generation.cancel.cancelled() => return,
            decoded = config.codec.decode(&mut reader) => decoded,
        };

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                if generation.calls.is_closing() {
                    debug!("Reader stopped while closing: {}", e);
                } else {
                    if e.is_disconnect() {
                        info!(
                            "Connection {} closed by peer: {}",
                            generation.describe(),
                            e
                        );
                    } else {
                        warn!(
                            "Failed to decode message from {}: {}",
                            generation.describe(),
                            e
                        );
                    }
                    config.event_hook.on_error(session);
                }
                return;
            }
        };
        generation
            .counters
            .frames_received
            .fetch_add(1, Ordering::Relaxed);

        let permit = match config.dispatch_overflow {
            DispatchOverflow::Block => tokio::select! {
                biased;
                _ = generation.cancel.cancelled() => return,
                permit = Arc::clone(&generation.dispatch).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            },
            DispatchOverflow::Drop => match Arc::clone(&generation.dispatch).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    generation
                        .counters
                        .dispatches_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Dispatch limit reached on generation {}, dropping inbound message",
                        generation.id
                    );
                    continue;
                }
            },
        };

        if generation.cancel.is_cancelled() {
            return;
        }

        let hook = Arc::clone(&config.event_hook);
        let inbound = InboundMessage::new(message, generation.id, Arc::clone(&generation.calls));
        let session = session.clone();
        tokio::spawn(async move {
            hook.on_receive(inbound, session).await;
            drop(permit);
        });
    }
}

pub(crate) async fn writer_pump<M: Send + 'static>(
    session: Session<M>,
    generation: Arc<Generation<M>>,
    mut outbound: mpsc::Receiver<Bytes>,
) {
    let outcome = AssertUnwindSafe(write_loop(&session, &generation, &mut outbound))
        .catch_unwind()
        .await;
    match outcome {
        Ok(true) => drain(&generation, &mut outbound),
        Ok(false) => {}
        Err(panic) => {
            let fault = Fault::from_panic(panic.as_ref());
            error!(
                "Writer pump for generation {} panicked: {}",
                generation.id, fault
            );
        }
    }

    // Writes after this point see a closed queue
    drop(outbound);
    debug!("Writer pump for generation {} exited", generation.id);
    generation.pump_exited();
    generation.close(&session, false).await;
}

/// Returns false when the stream may have been left mid-frame
async fn write_loop<M: Send + 'static>(
    session: &Session<M>,
    generation: &Arc<Generation<M>>,
    outbound: &mut mpsc::Receiver<Bytes>,
) -> bool {
    loop {
        let frame = tokio::select! {
            biased;
            _ = generation.cancel.cancelled() => return true,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => return true,
            },
        };

        let written = tokio::select! {
            biased;
            _ = generation.cancel.cancelled() => return false,
            written = generation.send_frame(&frame) => written,
        };

        if let Err(e) = written {
            if generation.calls.is_closing() {
                debug!("Writer stopped while closing: {}", e);
            } else {
                error!(
                    "Failed to write to {}: {}",
                    generation.describe(),
                    e
                );
                session.shared.config.event_hook.on_error(session);
            }
            return false;
        }
    }
}

/// Offer what is still queued to the socket without waiting on it. The first
/// write that cannot finish immediately abandons the rest.
fn drain<M: Send + 'static>(generation: &Generation<M>, outbound: &mut mpsc::Receiver<Bytes>) {
    outbound.close();

    let mut flushed = 0usize;
    let mut abandoned = 0usize;
    while let Ok(frame) = outbound.try_recv() {
        if abandoned > 0 {
            abandoned += 1;
            continue;
        }
        match generation.send_frame(&frame).now_or_never() {
            Some(Ok(())) => flushed += 1,
            Some(Err(e)) => {
                debug!("Drain write failed: {}", e);
                abandoned += 1;
            }
            None => abandoned += 1,
        }
    }

    if flushed + abandoned > 0 {
        debug!(
            "Writer drain for generation {}: {} flushed, {} abandoned",
            generation.id, flushed, abandoned
        );
    }
}
