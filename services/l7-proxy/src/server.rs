//! TLS-terminating HTTP listener.
//!
//! Accepts TCP connections, completes the TLS handshake with the
//! process-wide certificate, and serves HTTP/1.1 on each stream with the
//! shared request handler. Handshake failures reject only that
//! connection.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use crate::handler::RequestHandler;

/// The terminating L7 listener.
pub struct L7Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<RequestHandler>,
}

impl L7Server {
    /// Bind the listener. A bind failure here is fatal for the process.
    pub async fn bind(
        addr: SocketAddr,
        acceptor: TlsAcceptor,
        handler: Arc<RequestHandler>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, "L7 listener bound");

        Ok(Self {
            listener,
            acceptor,
            handler,
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
                    let acceptor = self.acceptor.clone();
                    let handler = Arc::clone(&self.handler);

                    tokio::spawn(
                        async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(tls_stream) => tls_stream,
                                Err(e) => {
                                    warn!(error = %e, "TLS handshake failed");
                                    return;
                                }
                            };

                            let service = service_fn(move |req| {
                                let handler = Arc::clone(&handler);
                                async move { Ok::<_, Infallible>(handler.handle(req).await) }
                            });

                            let io = TokioIo::new(tls_stream);
                            if let Err(e) =
                                http1::Builder::new().serve_connection(io, service).await
                            {
                                debug!(error = %e, "Connection error");
                            }
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
}
