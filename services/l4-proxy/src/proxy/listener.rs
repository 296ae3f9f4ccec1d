//! TCP listener and connection forwarding.
//!
//! Each accepted connection is handled on its own task: the first TLS
//! record is read with a deadline, the SNI hostname becomes the routing
//! selector, the registry picks a backend round-robin, the buffered
//! handshake bytes are replayed to the backend, and from then on the proxy
//! pumps raw bytes in both directions without touching the payload. TLS is
//! terminated by the backend, never here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use weft_fabric::{ProxyMetrics, Registry};

use super::sni;

/// Default deadline for the initial handshake read.
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default backend connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the L4 listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Deadline for reading the ClientHello.
    pub peek_timeout: Duration,
    /// Backend connect timeout.
    pub connect_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// The SNI-routing L4 listener.
pub struct L4Listener {
    config: ListenerConfig,
    listener: TcpListener,
    registry: Arc<Registry>,
    metrics: Arc<ProxyMetrics>,
}

impl L4Listener {
    /// Bind the listener. A bind failure here is fatal for the process.
    pub async fn bind(
        config: ListenerConfig,
        registry: Arc<Registry>,
        metrics: Arc<ProxyMetrics>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(bind_addr = %listener.local_addr()?, "L4 listener bound");

        Ok(Self {
            config,
            listener,
            registry,
            metrics,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the future is dropped.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let listener = Arc::clone(&self);
                    let metrics = Arc::clone(&self.metrics);

                    tokio::spawn(
                        async move {
                            let _guard = Arc::clone(&metrics).connection_guard();
                            metrics.incr_requests();
                            let started = Instant::now();

                            if let Err(e) = listener.handle_connection(stream).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                            }

                            metrics.observe_latency(started.elapsed());
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid a tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection end to end.
    ///
    /// Every failure path closes the client socket by dropping it; none of
    /// them escapes the worker.
    async fn handle_connection(&self, mut client: TcpStream) -> io::Result<()> {
        let mut peeked = Vec::new();
        let read = timeout(
            self.config.peek_timeout,
            sni::read_client_hello(&mut client, &mut peeked),
        )
        .await;

        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("Timed out reading ClientHello");
                self.metrics.incr_errors();
                return Ok(());
            }
        };

        let selector = match sni::parse_client_hello(&peeked[..n]) {
            Ok(host) => host.to_ascii_lowercase(),
            Err(e) => {
                warn!(error = %e, "Failed to extract SNI");
                self.metrics.incr_errors();
                return Ok(());
            }
        };

        let backend = match self.registry.next(&selector).await {
            Ok(backend) => backend,
            Err(e) => {
                // Routing failures close the connection without a response.
                debug!(selector = %selector, error = %e, "No route");
                self.metrics.incr_errors();
                return Ok(());
            }
        };

        let mut upstream = match timeout(
            self.config.connect_timeout,
            TcpStream::connect(backend.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(backend = %backend, error = %e, "Backend dial failed");
                self.metrics.incr_errors();
                return Ok(());
            }
            Err(_) => {
                warn!(backend = %backend, "Backend dial timed out");
                self.metrics.incr_errors();
                return Ok(());
            }
        };

        debug!(selector = %selector, backend = %backend, "Forwarding connection");

        // Replay the buffered handshake bytes so the backend sees the
        // ClientHello exactly as the client sent it.
        upstream.write_all(&peeked[..n]).await?;

        let (to_backend, from_backend) = proxy_bidirectional(&mut client, &mut upstream).await?;
        debug!(
            bytes_to_backend = to_backend + n as u64,
            bytes_from_backend = from_backend,
            "Connection closed"
        );

        Ok(())
    }
}

/// Pump bytes between two streams until both directions reach EOF.
///
/// When one direction sees EOF, write-closure is signalled to its peer via
/// `shutdown` and the opposite direction keeps draining. Returns
/// (bytes client→backend, bytes backend→client), counting only bytes after
/// the replayed handshake prefix.
async fn proxy_bidirectional(
    client: &mut TcpStream,
    backend: &mut TcpStream,
) -> io::Result<(u64, u64)> {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let client_to_backend = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; 8192];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    backend_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        backend_write.shutdown().await?;
        Ok(total)
    };

    let backend_to_client = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; 8192];
        loop {
            match backend_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    client_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        client_write.shutdown().await?;
        Ok(total)
    };

    let (c2b, b2c) = tokio::join!(client_to_backend, backend_to_client);

    // Report bytes moved even if one direction errored out.
    Ok((c2b.unwrap_or(0), b2c.unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_defaults() {
        let config = ListenerConfig::new("127.0.0.1:443".parse().unwrap());
        assert_eq!(config.peek_timeout, DEFAULT_PEEK_TIMEOUT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }
}
