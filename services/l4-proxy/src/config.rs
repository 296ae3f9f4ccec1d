//! L4 proxy configuration (env-driven).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// L4 proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data-plane listen address.
    pub listen_addr: SocketAddr,

    /// Control-plane (registration) listen address.
    pub control_addr: SocketAddr,

    /// Metrics listen address.
    pub metrics_addr: SocketAddr,

    /// Deadline for reading the initial ClientHello.
    pub peek_timeout: Duration,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = parse_addr("WEFT_LISTEN_ADDR", "0.0.0.0:443")?;
        let control_addr = parse_addr("WEFT_CONTROL_ADDR", "0.0.0.0:8081")?;
        let metrics_addr = parse_addr("WEFT_METRICS_ADDR", "0.0.0.0:9100")?;

        let peek_timeout = parse_millis("WEFT_PEEK_TIMEOUT_MS", 5000)?;
        let connect_timeout = parse_millis("WEFT_CONNECT_TIMEOUT_MS", 5000)?;

        let log_level = std::env::var("WEFT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            control_addr,
            metrics_addr,
            peek_timeout,
            connect_timeout,
            log_level,
        })
    }
}

pub(crate) fn parse_addr(var: &str, default: &str) -> Result<SocketAddr> {
    std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{var} must be a socket address (host:port)"))
}

pub(crate) fn parse_millis(var: &str, default: u64) -> Result<Duration> {
    let millis: u64 = std::env::var(var)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{var} must be an integer (milliseconds)"))?
        .unwrap_or(default);
    Ok(Duration::from_millis(millis.max(1)))
}
