//! Tether client binary.
//!
//! Dials a frame server, sends each stdin line as a request frame carrying a
//! fresh sequence id and prints the correlated reply. Frames the server sends
//! without a sequence id are printed as events. Ctrl-C closes the session.

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_session::{
    Call, Error as SessionError, EventHook, InboundMessage, Session, SessionConfig, TlsClientConfig,
};
use tether_wire::{Frame, FrameCodec};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::TetherConfig;
use logging::TetherLogFormatter;

/// Reconnecting line-oriented client for length-prefixed frame servers
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Reconnecting TCP client with request/reply correlation")]
struct Args {
    /// Server address, e.g. 127.0.0.1:9000
    #[arg(long)]
    addr: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "tether.yaml")]
    config: PathBuf,

    /// Re-dial after the connection drops
    #[arg(long)]
    reconnect: bool,

    /// Pause between dial attempts, e.g. 2s; 0s makes a dial failure fatal
    #[arg(long)]
    reconnect_interval: Option<humantime::Duration>,

    /// Outbound queue capacity
    #[arg(long)]
    buffer_size: Option<usize>,

    /// How long a request waits for its reply, e.g. 10s
    #[arg(long)]
    request_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    // TLS options
    /// Enable TLS
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate file (PEM format)
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Path to client certificate file for mTLS (PEM format)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to client private key file for mTLS (PEM format)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Server name for TLS SNI
    #[arg(long)]
    tls_sni: Option<String>,
}

impl Args {
    /// Layer explicit flags over the loaded configuration
    fn apply(&self, config: &mut TetherConfig) {
        if let Some(addr) = &self.addr {
            config.addr = addr.clone();
        }
        if self.reconnect {
            config.reconnect = true;
        }
        if let Some(interval) = self.reconnect_interval {
            config.reconnect_interval = interval.into();
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(timeout) = self.request_timeout {
            config.request_timeout = timeout.into();
        }
        if self.tls {
            config.tls.enabled = true;
        }
        if let Some(ca) = &self.tls_ca {
            config.tls.ca_file = ca.to_string_lossy().to_string();
        }
        if let Some(cert) = &self.tls_cert {
            config.tls.cert_file = cert.to_string_lossy().to_string();
        }
        if let Some(key) = &self.tls_key {
            config.tls.key_file = key.to_string_lossy().to_string();
        }
        if let Some(sni) = &self.tls_sni {
            config.tls.server_name = sni.clone();
        }
    }
}

/// Completes calls from correlated replies and prints everything else
struct ConsoleHook;

#[async_trait]
impl EventHook<Frame> for ConsoleHook {
    fn on_connect(&self, session: &Session<Frame>) -> bool {
        component_info!(
            "session",
            "Connected to {} (generation {})",
            session.addr(),
            session.generation()
        );
        true
    }

    async fn on_receive(&self, inbound: InboundMessage<Frame>, _session: Session<Frame>) {
        let seq_id = inbound.message().seq_id;
        if inbound.message().is_correlated() {
            match inbound.remove_call(seq_id) {
                Some(call) => {
                    call.complete(inbound.into_message());
                }
                None => component_debug!(
                    "session",
                    "Late reply for seq {} on generation {}",
                    seq_id,
                    inbound.generation()
                ),
            }
            return;
        }

        let frame = inbound.into_message();
        println!("event: {}", String::from_utf8_lossy(&frame.payload));
    }

    fn on_close(&self, session: &Session<Frame>) {
        component_info!(
            "session",
            "Connection to {} closing (generation {})",
            session.addr(),
            session.generation()
        );
    }

    fn on_error(&self, session: &Session<Frame>) {
        component_warn!("session", "Connection to {} failed", session.addr());
    }
}

#[cfg(feature = "tls")]
async fn load_tls(config: &TetherConfig) -> anyhow::Result<Option<TlsClientConfig>> {
    use tether_session::tls::make_client_config;

    if !config.tls.enabled {
        return Ok(None);
    }
    if config.tls.ca_file.is_empty() {
        anyhow::bail!("TLS enabled but no CA file given (--tls-ca)");
    }

    info!("Loading TLS configuration, ca={}", config.tls.ca_file);
    let ca_pem = tokio::fs::read_to_string(&config.tls.ca_file)
        .await
        .with_context(|| format!("Failed to read CA file {}", config.tls.ca_file))?;

    let identity = if config.tls.cert_file.is_empty() {
        None
    } else {
        let cert_pem = tokio::fs::read_to_string(&config.tls.cert_file)
            .await
            .with_context(|| format!("Failed to read certificate file {}", config.tls.cert_file))?;
        let key_pem = tokio::fs::read_to_string(&config.tls.key_file)
            .await
            .with_context(|| format!("Failed to read private key file {}", config.tls.key_file))?;
        Some((cert_pem, key_pem))
    };

    let client_config = make_client_config(
        &ca_pem,
        identity.as_ref().map(|(c, k)| (c.as_str(), k.as_str())),
    )?;

    Ok(Some(TlsClientConfig {
        client_config: Arc::new(client_config),
        server_name: config.server_name(),
    }))
}

#[cfg(not(feature = "tls"))]
async fn load_tls(config: &TetherConfig) -> anyhow::Result<Option<TlsClientConfig>> {
    if config.tls.enabled {
        anyhow::bail!("TLS requested but not compiled with TLS support. Build with --features tls");
    }
    Ok(None)
}

/// Register a call, send `line` under its sequence id and print the reply
fn send_request(session: &Session<Frame>, line: String, request_timeout: Duration) {
    let call = match session.register_call() {
        Ok(call) => call,
        Err(e) => {
            component_warn!("client", "Cannot send request: {}", e);
            return;
        }
    };

    let seq_id = call.seq_id();
    let generation = call.generation();
    if let Err(e) = session.write(&Frame::new(seq_id, line)) {
        session.remove_call(generation, seq_id);
        match e {
            SessionError::WouldBlock => {
                component_warn!("client", "Outbound queue full, request dropped")
            }
            other => component_error!("client", "Failed to send request: {}", other),
        }
        return;
    }

    let session = session.clone();
    tokio::spawn(async move {
        match await_reply(&session, call, request_timeout).await {
            Ok(reply) => {
                println!("reply[{}]: {}", seq_id, String::from_utf8_lossy(&reply.payload))
            }
            Err(e) => component_warn!("client", "Request {} failed: {}", seq_id, e),
        }
    });
}

/// Wait for the reply to `call`. On timeout the call is removed from the
/// connection it was registered on, so its sequence id can be reused.
async fn await_reply(
    session: &Session<Frame>,
    call: Call<Frame>,
    request_timeout: Duration,
) -> anyhow::Result<Frame> {
    let (generation, seq_id) = (call.generation(), call.seq_id());
    match tokio::time::timeout(request_timeout, call.done()).await {
        Ok(reply) => Ok(reply?),
        Err(_) => {
            session.remove_call(generation, seq_id);
            anyhow::bail!("no reply within {:?}", request_timeout)
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("tether={}", args.log_level).parse()?)
        .add_directive(format!("tether_session={}", args.log_level).parse()?)
        .add_directive(format!("tether_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(TetherLogFormatter::new("tether"))
        .init();

    info!("Starting tether v{}", env!("CARGO_PKG_VERSION"));

    let mut config = TetherConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    info!(
        "Client config: addr={}, reconnect={}, reconnect_interval={:?}, buffer_size={}",
        config.addr, config.reconnect, config.reconnect_interval, config.buffer_size
    );

    let mut builder = SessionConfig::builder()
        .codec(FrameCodec::new())
        .event_hook(Arc::new(ConsoleHook))
        .buffer_size(config.buffer_size)
        .reconnect(config.reconnect)
        .reconnect_interval(config.reconnect_interval)
        .dispatch_limit(config.dispatch_limit);
    if let Some(tls) = load_tls(&config).await? {
        builder = builder.tls(tls);
    }
    let session_config = builder.build()?;

    let session = tokio::select! {
        session = Session::dial(config.addr.clone(), session_config) => {
            session.with_context(|| format!("Failed to connect to {}", config.addr))?
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while connecting");
            return Ok(());
        }
    };
    session.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, closing session");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => send_request(&session, line, config.request_timeout),
                None => {
                    info!("stdin closed, closing session");
                    break;
                }
            },
        }

        if session.is_terminated() {
            component_warn!("client", "Session ended");
            break;
        }
    }

    session.close(true).await;
    let stats = session.stats();
    info!(
        "Session closed: generation={}, frames_sent={}, frames_received={}",
        stats.generation, stats.frames_sent, stats.frames_received
    );
    Ok(())
}
