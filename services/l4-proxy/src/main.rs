//! weft L4 proxy
//!
//! SNI-routing reverse proxy with TLS passthrough. This binary:
//! - Accepts TCP connections and peeks the TLS ClientHello for SNI
//! - Routes each connection to a runtime-registered backend, round-robin
//! - Pumps bytes bidirectionally without terminating TLS
//! - Serves backend registration on the control port and Prometheus
//!   metrics on the metrics port

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use weft_l4_proxy::{run, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting weft L4 proxy");
    info!(
        listen_addr = %config.listen_addr,
        control_addr = %config.control_addr,
        metrics_addr = %config.metrics_addr,
        peek_timeout_ms = config.peek_timeout.as_millis() as u64,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    run(config).await
}
