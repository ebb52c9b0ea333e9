//! Client session lifecycle.
//!
//! A [`Session`] is a cheap handle onto shared state holding the dial target,
//! the configuration and the current connection *generation*. A generation
//! owns everything tied to one socket: the two pumps, the call table, the
//! outbound queue, the cancellation token and the close guard. Reconnecting
//! builds a fresh generation and swaps it in atomically; code that needs
//! generation state loads the handle once and works on that snapshot.

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::call::{Call, CallTable, PendingCall};
use crate::config::SessionConfig;
use crate::error::{Error, Fault};
use crate::pump;
use crate::queue::OutboundQueue;
use crate::transport::{open_stream, IoStream};

/// Lifecycle of one connection generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Socket established, pumps not started
    Connected,
    /// Pumps running
    Running,
    /// Close guard entered, tearing down
    Closing,
    /// Socket closed and pumps gone
    Closed,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Connected,
            1 => Lifecycle::Running,
            2 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }
}

/// Statistics for the current generation
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Generation number, starting at 1
    pub generation: u64,
    /// Frames written to the socket
    pub frames_sent: u64,
    /// Bytes written to the socket
    pub bytes_sent: u64,
    /// Messages decoded from the socket
    pub frames_received: u64,
    /// Inbound messages dropped because every dispatch slot was busy
    pub dispatches_dropped: u64,
    /// Calls waiting for a reply
    pub pending_calls: usize,
    /// Frames waiting in the outbound queue
    pub queued_frames: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) frames_sent: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) dispatches_dropped: AtomicU64,
}

/// Everything tied to one established socket
pub(crate) struct Generation<M> {
    pub(crate) id: u64,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    lifecycle: AtomicU8,
    pub(crate) calls: Arc<CallTable<M>>,
    /// Serializes enqueueing with the terminate sweep
    sending: Mutex<()>,
    outbound: OutboundQueue,
    reader: Mutex<Option<ReadHalf<IoStream>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<IoStream>>>,
    pub(crate) cancel: CancellationToken,
    /// Claimed by the first closer; the teardown itself runs on its own task
    close_started: AtomicBool,
    closed: watch::Sender<bool>,
    live_pumps: watch::Sender<usize>,
    pub(crate) dispatch: Arc<Semaphore>,
    heartbeat: AtomicU64,
    pub(crate) counters: Counters,
}

impl<M: Send + 'static> Generation<M> {
    fn new(id: u64, stream: IoStream, config: &SessionConfig<M>) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        let (reader, writer) = tokio::io::split(stream);
        let (live_pumps, _) = watch::channel(0usize);
        let (closed, _) = watch::channel(false);

        Self {
            id,
            peer_addr,
            local_addr,
            lifecycle: AtomicU8::new(Lifecycle::Connected as u8),
            calls: Arc::new(CallTable::new(id)),
            sending: Mutex::new(()),
            outbound: OutboundQueue::new(config.buffer_size),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            cancel: CancellationToken::new(),
            close_started: AtomicBool::new(false),
            closed,
            live_pumps,
            dispatch: Arc::new(Semaphore::new(config.dispatch_limit)),
            heartbeat: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        self.lifecycle.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn describe(&self) -> String {
        format!(
            "<{} -> {}>",
            fmt_addr(self.local_addr),
            fmt_addr(self.peer_addr)
        )
    }

    fn enqueue(&self, frame: Bytes) -> Result<(), Error> {
        let _sending = self.sending.lock();
        self.outbound.try_enqueue(frame)
    }

    /// Write one frame fully to the socket
    pub(crate) async fn send_frame(&self, frame: &[u8]) -> Result<(), Error> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "socket already closed",
            ))
        })?;

        writer.write_all(frame).await?;
        writer.flush().await?;

        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Record that a pump finished its loop
    pub(crate) fn pump_exited(&self) {
        self.live_pumps.send_modify(|live| *live = live.saturating_sub(1));
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            generation: self.id,
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            dispatches_dropped: self.counters.dispatches_dropped.load(Ordering::Relaxed),
            pending_calls: self.calls.len(),
            queued_frames: self.outbound.len(),
        }
    }

    /// Close this generation. The body runs at most once, on a task of its
    /// own, so dropping a waiting caller never interrupts the teardown.
    /// Every caller waits for it to finish.
    pub(crate) async fn close(self: &Arc<Self>, session: &Session<M>, forced: bool) {
        if self
            .close_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let generation = Arc::clone(self);
            let session = session.clone();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(generation.shutdown(&session, forced))
                    .catch_unwind()
                    .await;
                if let Err(panic) = outcome {
                    error!(
                        "Shutdown of generation {} panicked: {}",
                        generation.id,
                        Fault::from_panic(panic.as_ref())
                    );
                }
                generation.closed.send_replace(true);
            });
        }

        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|done| *done).await;
    }

    async fn shutdown(self: &Arc<Self>, session: &Session<M>, forced: bool) {
        debug!(
            "Session generation {} is closing {}",
            self.id,
            self.describe()
        );
        self.set_lifecycle(Lifecycle::Closing);

        session.shared.config.event_hook.on_close(session);

        // Stop registrations and reader continuations first
        self.calls.set_closing(true);

        let terminated = {
            let _sending = self.sending.lock();
            self.calls.terminate_all(|| Error::ClientClosing)
        };
        if terminated > 0 {
            debug!("Terminated {} pending calls", terminated);
        }

        self.close_socket();
        self.cancel.cancel();

        let mut live = self.live_pumps.subscribe();
        let _ = live.wait_for(|n| *n == 0).await;

        // A writer caught mid-write held the socket until it saw the cancel
        self.close_socket();
        self.outbound.close();
        self.set_lifecycle(Lifecycle::Closed);

        info!(
            "Session with {} ended. Stats: {:?}",
            session.shared.addr,
            self.stats()
        );

        if !forced && session.shared.config.reconnect && !session.shared.terminated.is_cancelled()
        {
            session.reconnect().await;
        }
    }

    /// Shut the write half down unless a write holds it. Never waits.
    fn close_socket(&self) {
        // Never handed to a reader pump
        drop(self.reader.lock().take());

        let Ok(mut guard) = self.writer.try_lock() else {
            debug!("Socket {} busy, closing after the writer stops", self.describe());
            return;
        };
        if let Some(mut writer) = guard.take() {
            match writer.shutdown().now_or_never() {
                Some(Ok(())) => debug!("Socket {} shut down", self.describe()),
                Some(Err(e)) => debug!("Socket shutdown for {} failed: {}", self.describe(), e),
                None => debug!("Socket {} dropped before shutdown completed", self.describe()),
            }
        }
    }
}

fn fmt_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub(crate) struct Shared<M> {
    pub(crate) addr: String,
    pub(crate) config: SessionConfig<M>,
    current: ArcSwap<Generation<M>>,
    generations: AtomicU64,
    /// Cancelled by a forced close; stops any reconnect in progress
    terminated: CancellationToken,
}

/// Handle to a reconnecting client session
pub struct Session<M> {
    pub(crate) shared: Arc<Shared<M>>,
}

impl<M> Clone for Session<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> fmt::Debug for Session<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("addr", &self.shared.addr)
            .field("generation", &self.shared.current.load().id)
            .finish_non_exhaustive()
    }
}

impl<M: Send + 'static> Session<M> {
    /// Connect to `addr` (`host:port`).
    ///
    /// Failed attempts are retried every `reconnect_interval`; with a zero
    /// interval the first failure is returned.
    pub async fn dial(addr: impl Into<String>, config: SessionConfig<M>) -> Result<Self, Error> {
        let addr = addr.into();
        let terminated = CancellationToken::new();
        let stream = dial_stream(&addr, &config, &terminated).await?;
        let generation = Generation::new(1, stream, &config);
        info!(
            "TCP connection established to {} {}",
            addr,
            generation.describe()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                addr,
                config,
                current: ArcSwap::from_pointee(generation),
                generations: AtomicU64::new(1),
                terminated,
            }),
        })
    }

    /// Notify the hook and spawn the reader and writer pumps
    pub fn start(&self) {
        self.start_generation(self.shared.current.load_full());
    }

    fn start_generation(&self, generation: Arc<Generation<M>>) {
        if !generation.transition(Lifecycle::Connected, Lifecycle::Running) {
            warn!(
                "Ignoring start for generation {} in state {:?}",
                generation.id,
                generation.lifecycle()
            );
            return;
        }
        info!("Session start, {}", generation.describe());

        if !self.shared.config.event_hook.on_connect(self) {
            warn!(
                "Connection to {} declined by event hook, closing",
                self.shared.addr
            );
            self.shared.terminated.cancel();
            let session = self.clone();
            tokio::spawn(async move { generation.close(&session, true).await });
            return;
        }

        generation.calls.set_closing(false);

        let reader = generation.reader.lock().take();
        let outbound = generation.outbound.take_receiver();
        let (Some(reader), Some(outbound)) = (reader, outbound) else {
            error!("Generation {} lost its socket before start", generation.id);
            return;
        };

        generation.live_pumps.send_replace(2);
        tokio::spawn(pump::reader_pump(
            self.clone(),
            Arc::clone(&generation),
            reader,
        ));
        tokio::spawn(pump::writer_pump(self.clone(), generation, outbound));
    }

    /// Encode `message` and queue it for the writer pump.
    ///
    /// Never waits: a full queue returns [`Error::WouldBlock`].
    pub fn write(&self, message: &M) -> Result<(), Error> {
        let codec = &self.shared.config.codec;
        let frame = match catch_unwind(AssertUnwindSafe(|| codec.encode(message))) {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                error!("Failed to encode message: {}", e);
                return Err(e.into());
            }
            Err(panic) => {
                let fault = Fault::from_panic(panic.as_ref());
                error!("Encoder fault on write path: {}", fault);
                return Err(Error::ServerClosed { cause: Some(fault) });
            }
        };

        self.shared.current.load().enqueue(frame)
    }

    /// Close the current generation.
    ///
    /// An unforced close reconnects when the configuration asks for it; a
    /// forced close leaves the session terminally closed.
    pub async fn close(&self, forced: bool) {
        if forced {
            self.shared.terminated.cancel();
        }

        loop {
            let generation = self.shared.current.load_full();
            generation.close(self, forced).await;

            // A reconnect may have swapped in a new generation meanwhile
            if !forced || Arc::ptr_eq(&generation, &*self.shared.current.load()) {
                break;
            }
        }
    }

    /// Re-dial the original address and swap in a fresh generation
    pub(crate) async fn reconnect(&self) {
        let shared = &self.shared;
        info!("Reconnecting to {}", shared.addr);

        let stream = match dial_stream(&shared.addr, &shared.config, &shared.terminated).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Reconnect to {} abandoned: {}", shared.addr, e);
                return;
            }
        };
        if shared.terminated.is_cancelled() {
            debug!("Session closed during reconnect, dropping new connection");
            return;
        }

        let id = shared.generations.fetch_add(1, Ordering::AcqRel) + 1;
        let generation = Arc::new(Generation::new(id, stream, &shared.config));
        shared.current.store(Arc::clone(&generation));
        info!("Reconnected to {} as generation {}", shared.addr, id);

        self.start_generation(generation);
    }

    /// Register a call whose reply will be correlated by sequence id
    pub fn register_call(&self) -> Result<Call<M>, Error> {
        self.shared.current.load().calls.register()
    }

    /// Remove the call registered under `seq_id` on connection `generation`.
    ///
    /// Returns `None` once that generation has been replaced; its calls were
    /// already terminated. Hooks should prefer [`InboundMessage::remove_call`].
    ///
    /// [`InboundMessage::remove_call`]: crate::hook::InboundMessage::remove_call
    pub fn remove_call(&self, generation: u64, seq_id: u16) -> Option<PendingCall<M>> {
        let current = self.shared.current.load();
        if current.id != generation {
            return None;
        }
        current.calls.remove(seq_id)
    }

    /// Store the protocol's heartbeat setting for this connection
    pub fn set_heartbeat(&self, heart: u64) {
        debug!("heartbeat time: {}", heart);
        self.shared
            .current
            .load()
            .heartbeat
            .store(heart, Ordering::Relaxed);
    }

    /// Heartbeat setting of the current connection, 0 if unset
    pub fn heartbeat(&self) -> u64 {
        self.shared.current.load().heartbeat.load(Ordering::Relaxed)
    }

    /// Dial target this session was created with
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Current generation number, incremented by every reconnect
    pub fn generation(&self) -> u64 {
        self.shared.current.load().id
    }

    /// Lifecycle state of the current generation
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.current.load().lifecycle()
    }

    /// Whether a forced close ended the session for good
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.is_cancelled()
    }

    /// Remote address of the current socket
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.current.load().peer_addr
    }

    /// Local address of the current socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.current.load().local_addr
    }

    /// Snapshot of the current generation's counters
    pub fn stats(&self) -> SessionStats {
        self.shared.current.load().stats()
    }
}

/// Dial until a socket is established, the retry policy gives up, or the
/// session is terminated
async fn dial_stream<M>(
    addr: &str,
    config: &SessionConfig<M>,
    terminated: &CancellationToken,
) -> Result<IoStream, Error> {
    loop {
        info!("Attempting to connect to {}", addr);

        let err = match open_stream(addr, config.tls.as_ref()).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        if config.reconnect_interval.is_zero() {
            error!("Failed to connect to {}: {}", addr, err);
            return Err(err);
        }

        warn!(
            "Failed to connect to {}: {}; retrying in {:?}",
            addr, err, config.reconnect_interval
        );
        tokio::select! {
            _ = terminated.cancelled() => return Err(Error::ClientClosing),
            _ = tokio::time::sleep(config.reconnect_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchOverflow, SessionConfigBuilder};
    use crate::hook::{EventHook, InboundMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tether_wire::{Codec, CodecError, Frame, FrameCodec};
    use tokio::io::AsyncRead;
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot, Notify};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct TestHook {
        accept: bool,
        connects: AtomicUsize,
        closes: AtomicUsize,
        errors: AtomicUsize,
        /// Calls still pending when `on_close` ran
        pending_at_close: AtomicUsize,
        gate: Option<Arc<Notify>>,
        received: mpsc::UnboundedSender<(u64, Frame)>,
    }

    impl TestHook {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(u64, Frame)>) {
            Self::build(true, None)
        }

        fn build(
            accept: bool,
            gate: Option<Arc<Notify>>,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<(u64, Frame)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let hook = Arc::new(Self {
                accept,
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
                pending_at_close: AtomicUsize::new(0),
                gate,
                received: tx,
            });
            (hook, rx)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHook<Frame> for TestHook {
        fn on_connect(&self, _session: &Session<Frame>) -> bool {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.accept
        }

        async fn on_receive(&self, inbound: InboundMessage<Frame>, _session: Session<Frame>) {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let generation = inbound.generation();
            let pending = match inbound.message() {
                frame if frame.is_correlated() => inbound.remove_call(frame.seq_id),
                _ => None,
            };
            let frame = inbound.into_message();
            if let Some(call) = pending {
                call.complete(frame.clone());
            }
            let _ = self.received.send((generation, frame));
        }

        fn on_close(&self, session: &Session<Frame>) {
            self.pending_at_close
                .store(session.stats().pending_calls, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _session: &Session<Frame>) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(hook: Arc<TestHook>) -> SessionConfigBuilder<Frame> {
        SessionConfig::builder()
            .codec(FrameCodec::new())
            .event_hook(hook)
            .reconnect_interval(Duration::from_millis(50))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn spawn_echo(socket: tokio::net::TcpStream) {
        tokio::spawn(async move {
            let mut socket = socket;
            let (mut r, mut w) = socket.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
    }

    async fn echo_server() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                spawn_echo(socket);
            }
        });
        (addr, handle)
    }

    /// First connection is held open until `drop_first` fires, then closed
    /// from the server side. Later connections echo.
    async fn dropping_server() -> (String, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (drop_tx, drop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let Ok((first, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = drop_rx.await;
                drop(first);
            });
            while let Ok((socket, _)) = listener.accept().await {
                spawn_echo(socket);
            }
        });
        (addr, drop_tx)
    }

    /// Accepts one connection and stops listening, so later dials are
    /// refused. The connection stays open while the returned sender lives.
    async fn single_use_server() -> (String, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            drop(listener);
            let _ = release_rx.await;
            drop(socket);
        });
        (addr, release_tx)
    }

    /// First connection is sent `greeting`, then closed once `drop_first`
    /// fires. Later connections echo.
    async fn greeting_server(greeting: Frame) -> (String, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (drop_tx, drop_rx) = oneshot::channel::<()>();
        let bytes = FrameCodec::new().encode(&greeting).unwrap();
        tokio::spawn(async move {
            let Ok((mut first, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = first.write_all(&bytes).await;
                let _ = drop_rx.await;
                drop(first);
            });
            while let Ok((socket, _)) = listener.accept().await {
                spawn_echo(socket);
            }
        });
        (addr, drop_tx)
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_backpressure_then_flush() {
        let (addr, _server) = echo_server().await;
        let (hook, mut received) = TestHook::new();
        let session = Session::dial(&addr, config(hook.clone()).buffer_size(2).build().unwrap())
            .await
            .unwrap();
        session.start();
        assert_eq!(session.lifecycle(), Lifecycle::Running);
        assert_eq!(hook.connects.load(Ordering::SeqCst), 1);

        // No await between writes, so the writer pump cannot drain yet
        let ping = Frame::event("ping");
        assert!(session.write(&ping).is_ok());
        assert!(session.write(&ping).is_ok());
        assert!(matches!(session.write(&ping), Err(Error::WouldBlock)));
        assert_eq!(session.stats().queued_frames, 2);

        assert!(eventually(|| session.stats().frames_sent == 2).await);
        assert!(session.write(&ping).is_ok());

        for _ in 0..3 {
            let (generation, frame) = timeout(Duration::from_secs(2), received.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(generation, 1);
            assert_eq!(frame, ping);
        }

        session.close(true).await;
    }

    #[tokio::test]
    async fn test_reply_completes_registered_call() {
        let (addr, _server) = echo_server().await;
        let (hook, _received) = TestHook::new();
        let session = Session::dial(&addr, config(hook).build().unwrap())
            .await
            .unwrap();
        session.start();

        let call = session.register_call().unwrap();
        assert_eq!(call.seq_id(), 1);
        session
            .write(&Frame::new(call.seq_id(), "request"))
            .unwrap();

        let reply = timeout(Duration::from_secs(2), call.done())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Frame::new(1, "request"));
        assert_eq!(session.stats().pending_calls, 0);
        assert!(session.stats().frames_received >= 1);

        session.close(true).await;
    }

    #[tokio::test]
    async fn test_peer_drop_terminates_pending_calls() {
        let (addr, drop_first) = dropping_server().await;
        let (hook, _received) = TestHook::new();
        let session = Session::dial(&addr, config(hook.clone()).build().unwrap())
            .await
            .unwrap();
        session.start();

        let first = session.register_call().unwrap();
        let second = session.register_call().unwrap();
        assert_ne!(first.seq_id(), second.seq_id());

        drop_first.send(()).unwrap();

        let first = timeout(Duration::from_secs(2), first.done()).await.unwrap();
        let second = timeout(Duration::from_secs(2), second.done()).await.unwrap();
        assert!(matches!(first, Err(Error::ClientClosing)));
        assert!(matches!(second, Err(Error::ClientClosing)));

        assert!(eventually(|| session.lifecycle() == Lifecycle::Closed).await);
        assert_eq!(hook.closes(), 1);
        assert_eq!(hook.errors.load(Ordering::SeqCst), 1);
        // The hook hears about the close before the calls are failed
        assert_eq!(hook.pending_at_close.load(Ordering::SeqCst), 2);
        assert_eq!(session.stats().pending_calls, 0);
        assert_eq!(session.stats().queued_frames, 0);

        // Reconnect is off: the session stays down
        assert_eq!(session.generation(), 1);
        assert!(matches!(session.register_call(), Err(Error::Shutdown)));
        assert!(matches!(
            session.write(&Frame::event("late")),
            Err(Error::ServerClosed { .. })
        ));

        session.close(false).await;
        assert_eq!(hook.closes(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_close_runs_once() {
        let (addr, drop_first) = dropping_server().await;
        let (hook, _received) = TestHook::new();
        let session = Session::dial(&addr, config(hook.clone()).build().unwrap())
            .await
            .unwrap();
        session.start();
        let call = session.register_call().unwrap();

        drop_first.send(()).unwrap();
        let closers: Vec<_> = (0..4)
            .map(|i| {
                let session = session.clone();
                tokio::spawn(async move { session.close(i % 2 == 0).await })
            })
            .collect();
        for closer in futures::future::join_all(closers).await {
            closer.unwrap();
        }

        assert_eq!(session.lifecycle(), Lifecycle::Closed);
        assert_eq!(hook.closes(), 1);
        assert!(matches!(call.done().await, Err(Error::ClientClosing)));
        assert!(matches!(session.register_call(), Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_reconnect_replaces_generation() {
        let (addr, drop_first) = dropping_server().await;
        let (hook, mut received) = TestHook::new();
        let session = Session::dial(&addr, config(hook.clone()).reconnect(true).build().unwrap())
            .await
            .unwrap();
        session.start();
        session.set_heartbeat(30);

        let stale = session.register_call().unwrap();
        drop_first.send(()).unwrap();

        assert!(matches!(
            timeout(Duration::from_secs(2), stale.done()).await.unwrap(),
            Err(Error::ClientClosing)
        ));
        assert!(eventually(|| session.generation() == 2
            && session.lifecycle() == Lifecycle::Running)
        .await);
        assert_eq!(hook.connects.load(Ordering::SeqCst), 2);
        assert_eq!(hook.closes(), 1);
        assert_eq!(session.heartbeat(), 0);

        // New generation, new table: ids start over and nothing stale remains
        assert_eq!(session.stats().pending_calls, 0);
        let call = session.register_call().unwrap();
        assert_eq!(call.seq_id(), 1);
        session.write(&Frame::new(call.seq_id(), "again")).unwrap();

        let reply = timeout(Duration::from_secs(2), call.done())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"again"));
        let (generation, _) = received.recv().await.unwrap();
        assert_eq!(generation, 2);

        session.close(true).await;
        assert!(session.is_terminated());
        assert_eq!(session.generation(), 2);
        assert_eq!(session.lifecycle(), Lifecycle::Closed);
        assert_eq!(hook.closes(), 2);
    }

    #[tokio::test]
    async fn test_late_reply_from_replaced_generation_is_not_misrouted() {
        let (addr, drop_first) = greeting_server(Frame::new(1, "stale")).await;
        let gate = Arc::new(Notify::new());
        let (hook, mut received) = TestHook::build(true, Some(gate.clone()));
        let session = Session::dial(&addr, config(hook).reconnect(true).build().unwrap())
            .await
            .unwrap();
        session.start();

        // The stale reply is dispatched on generation 1 and parked at the gate
        assert!(eventually(|| session.stats().frames_received == 1).await);
        drop_first.send(()).unwrap();
        assert!(eventually(|| session.generation() == 2
            && session.lifecycle() == Lifecycle::Running)
        .await);

        let mut call = session.register_call().unwrap();
        assert_eq!(call.seq_id(), 1);
        assert_eq!(call.generation(), 2);
        assert!(session.remove_call(1, call.seq_id()).is_none());

        gate.notify_one();
        let (generation, frame) = timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(generation, 1);
        assert_eq!(frame.payload, Bytes::from_static(b"stale"));
        assert!(call.try_outcome().is_none());
        assert_eq!(session.stats().pending_calls, 1);

        session.write(&Frame::new(call.seq_id(), "fresh")).unwrap();
        gate.notify_one();
        let reply = timeout(Duration::from_secs(2), call.done())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"fresh"));

        session.close(true).await;
    }

    #[tokio::test]
    async fn test_cancelled_close_does_not_rerun_shutdown() {
        let (addr, _release) = single_use_server().await;
        let (hook, _received) = TestHook::new();
        let session = Session::dial(&addr, config(hook.clone()).reconnect(true).build().unwrap())
            .await
            .unwrap();
        session.start();

        // Teardown moves on to re-dialing a refused port and keeps retrying
        assert!(timeout(Duration::from_millis(200), session.close(false))
            .await
            .is_err());
        assert_eq!(hook.closes(), 1);
        assert_eq!(session.lifecycle(), Lifecycle::Closed);

        timeout(Duration::from_secs(2), session.close(true))
            .await
            .unwrap();
        assert_eq!(hook.closes(), 1);
        assert!(session.is_terminated());
        assert_eq!(session.generation(), 1);
        assert_eq!(hook.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_close_does_not_reconnect() {
        let (addr, _server) = echo_server().await;
        let (hook, _received) = TestHook::new();
        let session = Session::dial(&addr, config(hook.clone()).reconnect(true).build().unwrap())
            .await
            .unwrap();
        session.start();

        session.close(true).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(session.generation(), 1);
        assert_eq!(session.lifecycle(), Lifecycle::Closed);
        assert_eq!(hook.connects.load(Ordering::SeqCst), 1);
        assert_eq!(hook.errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_is_fatal_without_interval() {
        let addr = closed_port().await;
        let (hook, _received) = TestHook::new();
        let config = config(hook)
            .reconnect_interval(Duration::ZERO)
            .build()
            .unwrap();

        match Session::dial(&addr, config).await {
            Err(Error::Dial { addr: target, .. }) => assert_eq!(target, addr),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("dial to a closed port succeeded"),
        }
    }

    #[tokio::test]
    async fn test_dial_retries_until_listener_appears() {
        let addr = closed_port().await;
        let (hook, _received) = TestHook::new();
        let dial = tokio::spawn(Session::dial(addr.clone(), config(hook).build().unwrap()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!dial.is_finished());
        let listener = TcpListener::bind(&addr).await.unwrap();

        let session = timeout(Duration::from_secs(2), dial)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(session.lifecycle(), Lifecycle::Connected);
        assert_eq!(session.peer_addr(), Some(listener.local_addr().unwrap()));
        session.close(true).await;
    }

    #[tokio::test]
    async fn test_declined_connection_closes_session() {
        let (addr, _server) = echo_server().await;
        let (hook, _received) = TestHook::build(false, None);
        let session = Session::dial(&addr, config(hook.clone()).reconnect(true).build().unwrap())
            .await
            .unwrap();
        session.start();

        assert!(eventually(|| session.lifecycle() == Lifecycle::Closed).await);
        assert!(session.is_terminated());
        assert_eq!(hook.closes(), 1);
        assert_eq!(session.generation(), 1);
        assert!(matches!(
            session.write(&Frame::event("nope")),
            Err(Error::ServerClosed { cause: None })
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_ignored() {
        let (addr, _server) = echo_server().await;
        let (hook, _received) = TestHook::new();
        let session = Session::dial(&addr, config(hook.clone()).build().unwrap())
            .await
            .unwrap();
        session.start();
        session.start();

        assert_eq!(hook.connects.load(Ordering::SeqCst), 1);
        session.close(true).await;
    }

    #[tokio::test]
    async fn test_drop_policy_sheds_dispatches() {
        let (addr, _server) = echo_server().await;
        let gate = Arc::new(Notify::new());
        let (hook, mut received) = TestHook::build(true, Some(gate.clone()));
        let config = config(hook)
            .dispatch_limit(1)
            .dispatch_overflow(DispatchOverflow::Drop)
            .build()
            .unwrap();
        let session = Session::dial(&addr, config).await.unwrap();
        session.start();

        for i in 0..3u8 {
            session.write(&Frame::event(vec![i])).unwrap();
        }

        assert!(eventually(|| session.stats().frames_received == 3).await);
        assert_eq!(session.stats().dispatches_dropped, 2);

        gate.notify_one();
        let (_, frame) = timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::event(vec![0u8]));

        session.close(true).await;
    }

    struct FaultyCodec {
        explode: AtomicBool,
    }

    #[async_trait]
    impl Codec for FaultyCodec {
        type Message = Frame;

        async fn decode(
            &self,
            reader: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<Frame, CodecError> {
            FrameCodec::new().decode(reader).await
        }

        fn encode(&self, message: &Frame) -> Result<Bytes, CodecError> {
            if self.explode.load(Ordering::SeqCst) {
                panic!("encoder state corrupted");
            }
            if message.payload.is_empty() {
                return Err(CodecError::Encode("empty payload".to_string()));
            }
            FrameCodec::new().encode(message)
        }
    }

    #[tokio::test]
    async fn test_write_path_faults_are_normalized() {
        let (addr, _server) = echo_server().await;
        let (hook, _received) = TestHook::new();
        let codec = Arc::new(FaultyCodec {
            explode: AtomicBool::new(false),
        });
        let config = SessionConfig::builder()
            .shared_codec(codec.clone())
            .event_hook(hook)
            .build()
            .unwrap();
        let session = Session::dial(&addr, config).await.unwrap();

        assert!(matches!(
            session.write(&Frame::event(Bytes::new())),
            Err(Error::Codec(CodecError::Encode(_)))
        ));

        codec.explode.store(true, Ordering::SeqCst);
        match session.write(&Frame::event("boom")) {
            Err(Error::ServerClosed { cause: Some(fault) }) => {
                assert!(fault.0.contains("encoder state corrupted"));
            }
            other => panic!("expected server closed, got {other:?}"),
        }

        session.close(true).await;
    }
}
