//! Control plane and observability endpoints.
//!
//! The control plane is a single unauthenticated endpoint: `POST /register`
//! adds a `(name, address)` pair to the registry. Real deployments front
//! this with a trusted network boundary.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::info;

use weft_fabric::{ProxyMetrics, Registry};

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    address: String,
}

/// Build the control-plane router.
pub fn control_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/register", post(register))
        .with_state(registry)
}

/// Build the metrics router served on the metrics port.
pub fn metrics_router(metrics: Arc<ProxyMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

/// Register a backend address for an SNI selector.
///
/// The body is parsed by hand so that malformed JSON and missing fields
/// both surface as 400 rather than an extractor-specific status.
async fn register(State(registry): State<Arc<Registry>>, body: Bytes) -> Response {
    let registration: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(registration) => registration,
        Err(e) => {
            info!(error = %e, "Rejected registration: invalid JSON");
            return (StatusCode::BAD_REQUEST, "Invalid JSON payload").into_response();
        }
    };

    if registration.name.is_empty() || registration.address.is_empty() {
        info!("Rejected registration: empty name or address");
        return (StatusCode::BAD_REQUEST, "Name and Address are required").into_response();
    }

    let selector = registration.name.to_lowercase();
    match registry.register(&selector, &registration.address).await {
        Ok(()) => {
            info!(
                selector = %selector,
                backend = %registration.address,
                "Backend registered"
            );
            (
                StatusCode::OK,
                format!("Backend {} registered successfully", registration.name),
            )
                .into_response()
        }
        Err(e) => {
            info!(error = %e, "Rejected registration");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

async fn render_metrics(State(metrics): State<Arc<ProxyMetrics>>) -> String {
    metrics.render()
}
