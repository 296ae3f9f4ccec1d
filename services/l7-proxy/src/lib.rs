//! weft L7 proxy library.
//!
//! Exposes the terminating server, request handler, and control-plane
//! router so the integration tests can drive them against ephemeral
//! ports; the binary in `main.rs` wires the same pieces to the configured
//! addresses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use weft_fabric::{MemoryCache, ProxyMetrics, Registry, ResponseCache};

pub mod config;
pub mod control;
pub mod handler;
pub mod server;

pub use config::Config;
pub use control::{control_router, metrics_router};
pub use handler::RequestHandler;
pub use server::L7Server;

/// How long to wait for in-flight requests on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Bind every listener and run the proxy until interrupted.
///
/// Certificate-load and bind failures are fatal and propagate out for a
/// non-zero exit. On ctrl-c the data plane stops accepting and in-flight
/// requests are drained up to [`DRAIN_DEADLINE`].
pub async fn run(config: Config) -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let acceptor = weft_fabric::tls::acceptor(&config.cert_file, &config.key_file)
        .context("failed to load TLS certificate")?;

    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(ProxyMetrics::new());
    let _sampler = Arc::clone(&metrics).spawn_sampler();

    let cache: Arc<dyn ResponseCache> = match config.cache_max_bytes {
        Some(cap) => Arc::new(MemoryCache::with_max_bytes(cap)),
        None => Arc::new(MemoryCache::unbounded()),
    };

    let handler = Arc::new(
        RequestHandler::new(
            Arc::clone(&registry),
            cache,
            Arc::clone(&metrics),
            config.connect_timeout,
        )
        .context("failed to build upstream HTTP client")?,
    );

    let control_listener = tokio::net::TcpListener::bind(config.control_addr)
        .await
        .with_context(|| format!("failed to bind control plane on {}", config.control_addr))?;
    info!(addr = %config.control_addr, "Control plane listening");
    let control_app = control_router(Arc::clone(&registry));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(control_listener, control_app).await {
            tracing::error!(error = %e, "Control plane server failed");
        }
    });

    let metrics_listener = tokio::net::TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {}", config.metrics_addr))?;
    info!(addr = %config.metrics_addr, "Metrics endpoint listening");
    let metrics_app = metrics_router(Arc::clone(&metrics));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, metrics_app).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let server = Arc::new(
        L7Server::bind(config.listen_addr, acceptor, handler)
            .await
            .with_context(|| format!("failed to bind data plane on {}", config.listen_addr))?,
    );

    tokio::select! {
        result = Arc::clone(&server).run() => {
            result.context("data plane listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, draining requests");
            drain(&metrics).await;
        }
    }

    Ok(())
}

/// Wait for the active-connection gauge to reach zero, bounded by the
/// drain deadline.
async fn drain(metrics: &Arc<ProxyMetrics>) {
    let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
    while metrics.active_connections() > 0 {
        if tokio::time::Instant::now() >= deadline {
            info!(
                remaining = metrics.active_connections(),
                "Drain deadline reached"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
