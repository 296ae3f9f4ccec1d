//! Control plane and observability endpoints.
//!
//! `POST /register-backend` binds a backend URL to a Host selector. The
//! endpoint is unauthenticated; real deployments front it with a trusted
//! network boundary.

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
    host: String,
    #[serde(default)]
    backend: String,
}

/// Build the control-plane router.
pub fn control_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/register-backend", post(register_backend))
        .with_state(registry)
}

/// Build the metrics router served on the metrics port.
pub fn metrics_router(metrics: Arc<ProxyMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

/// Register a backend URL for a Host selector.
///
/// The body is parsed by hand so that malformed JSON and missing fields
/// both surface as 400 rather than an extractor-specific status.
async fn register_backend(State(registry): State<Arc<Registry>>, body: Bytes) -> Response {
    let registration: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(registration) => registration,
        Err(e) => {
            info!(error = %e, "Rejected registration: invalid JSON");
            return (StatusCode::BAD_REQUEST, "Invalid JSON payload").into_response();
        }
    };

    if registration.host.is_empty() || registration.backend.is_empty() {
        info!("Rejected registration: empty host or backend");
        return (StatusCode::BAD_REQUEST, "Host and Backend are required").into_response();
    }

    let selector = registration.host.to_lowercase();
    match registry.register(&selector, &registration.backend).await {
        Ok(()) => {
            info!(
                selector = %selector,
                backend = %registration.backend,
                "Backend registered"
            );
            (
                StatusCode::OK,
                format!(
                    "Backend {} registered successfully for host {}",
                    registration.backend, registration.host
                ),
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
