//! L7 proxy configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// L7 proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data-plane (TLS) listen address.
    pub listen_addr: SocketAddr,

    /// Control-plane (registration) listen address.
    pub control_addr: SocketAddr,

    /// Metrics listen address.
    pub metrics_addr: SocketAddr,

    /// TLS certificate file (PEM).
    pub cert_file: PathBuf,

    /// TLS private key file (PEM).
    pub key_file: PathBuf,

    /// Upstream connect timeout.
    pub connect_timeout: Duration,

    /// Optional byte cap for the response cache. Unbounded when unset.
    pub cache_max_bytes: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = parse_addr("WEFT_LISTEN_ADDR", "0.0.0.0:443")?;
        let control_addr = parse_addr("WEFT_CONTROL_ADDR", "0.0.0.0:8081")?;
        let metrics_addr = parse_addr("WEFT_METRICS_ADDR", "0.0.0.0:9100")?;

        let cert_file = std::env::var("WEFT_CERT_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./cert.pem"));
        let key_file = std::env::var("WEFT_KEY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./key.pem"));

        let connect_timeout = parse_millis("WEFT_CONNECT_TIMEOUT_MS", 5000)?;

        let cache_max_bytes = std::env::var("WEFT_CACHE_MAX_BYTES")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("WEFT_CACHE_MAX_BYTES must be an integer (bytes)")?;

        let log_level = std::env::var("WEFT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            control_addr,
            metrics_addr,
            cert_file,
            key_file,
            connect_timeout,
            cache_max_bytes,
            log_level,
        })
    }
}

fn parse_addr(var: &str, default: &str) -> Result<SocketAddr> {
    std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{var} must be a socket address (host:port)"))
}

fn parse_millis(var: &str, default: u64) -> Result<Duration> {
    let millis: u64 = std::env::var(var)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{var} must be an integer (milliseconds)"))?
        .unwrap_or(default);
    Ok(Duration::from_millis(millis.max(1)))
}
