//! Configuration handling for the tether CLI.
//!
//! Values come from an optional YAML file, then `TETHER_*` environment
//! variables, then explicit command line flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tether_session::{DEFAULT_BUFFER_SIZE, DEFAULT_DISPATCH_LIMIT, DEFAULT_RECONNECT_INTERVAL};
use tracing::{info, warn};

/// Tether client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TetherConfig {
    /// Dial target, `host:port`
    pub addr: String,
    /// Re-dial after the connection drops
    pub reconnect: bool,
    /// Pause between dial attempts
    #[serde(with = "humantime_serde_compat")]
    pub reconnect_interval: Duration,
    /// Outbound queue capacity
    pub buffer_size: usize,
    /// Maximum concurrent inbound dispatches
    pub dispatch_limit: usize,
    /// How long a request waits for its reply
    #[serde(with = "humantime_serde_compat")]
    pub request_timeout: Duration,
    /// TLS configuration
    pub tls: TlsConfig,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to client certificate file, for mTLS
    pub cert_file: String,
    /// Path to client private key file, for mTLS
    pub key_file: String,
    /// Path to CA certificate file
    pub ca_file: String,
    /// Server name for SNI; defaults to the dial host
    pub server_name: String,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9000".to_string(),
            reconnect: false,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            dispatch_limit: DEFAULT_DISPATCH_LIMIT,
            request_timeout: Duration::from_secs(10),
            tls: TlsConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML layout)
#[derive(Debug, Deserialize)]
struct RootConfig {
    tether: Option<TetherConfig>,
}

/// Durations in YAML are written the humantime way, e.g. `2s` or `500ms`
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl TetherConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.tether.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `TETHER_*` overrides from `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("TETHER_ADDR") {
            info!("Address overridden by environment: {}", addr);
            self.addr = addr;
        }

        if let Some(reconnect) = lookup("TETHER_RECONNECT") {
            self.reconnect = matches!(reconnect.to_lowercase().as_str(), "1" | "true" | "yes");
            info!("Reconnect overridden by environment: {}", self.reconnect);
        }

        if let Some(interval) = lookup("TETHER_RECONNECT_INTERVAL") {
            match humantime::parse_duration(&interval) {
                Ok(interval) => {
                    self.reconnect_interval = interval;
                    info!("Reconnect interval overridden by environment: {:?}", interval);
                }
                Err(e) => warn!("Ignoring TETHER_RECONNECT_INTERVAL={}: {}", interval, e),
            }
        }

        if let Some(size) = lookup("TETHER_BUFFER_SIZE") {
            match size.parse::<usize>() {
                Ok(size) => {
                    self.buffer_size = size;
                    info!("Buffer size overridden by environment: {}", size);
                }
                Err(e) => warn!("Ignoring TETHER_BUFFER_SIZE={}: {}", size, e),
            }
        }

        if let Some(ca_file) = lookup("TETHER_TLS_CA") {
            self.tls.enabled = true;
            self.tls.ca_file = ca_file;
        }
    }

    /// SNI name: configured value or the host part of the address
    pub fn server_name(&self) -> String {
        if !self.tls.server_name.is_empty() {
            return self.tls.server_name.clone();
        }
        match self.addr.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']').to_string(),
            None => self.addr.clone(),
        }
    }
}
