//! weft L7 proxy
//!
//! TLS-terminating reverse proxy with Host-header routing. This binary:
//! - Terminates TLS with the process-wide certificate
//! - Routes each HTTP request to a runtime-registered backend, round-robin
//! - Caches full response bodies keyed by (host, method, URL)
//! - Serves backend registration on the control port and Prometheus
//!   metrics on the metrics port

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use weft_l7_proxy::{run, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting weft L7 proxy");
    info!(
        listen_addr = %config.listen_addr,
        control_addr = %config.control_addr,
        metrics_addr = %config.metrics_addr,
        cert_file = %config.cert_file.display(),
        key_file = %config.key_file.display(),
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        cache_max_bytes = ?config.cache_max_bytes,
        "Configuration loaded"
    );

    run(config).await
}
