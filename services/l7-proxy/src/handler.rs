//! Per-request forwarding with a read-through response cache.
//!
//! One handler instance is shared by all connections. Each request is
//! routed by its `Host` header: cache hits short-circuit, misses pick the
//! next backend round-robin, forward the request upstream, record the full
//! response body, and relay status, headers, and body to the client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{header, HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use tracing::{debug, info, warn};

use weft_fabric::{ProxyMetrics, Registry, ResponseCache};

/// Shared request handler for the L7 data plane.
pub struct RequestHandler {
    registry: Arc<Registry>,
    cache: Arc<dyn ResponseCache>,
    client: reqwest::Client,
    metrics: Arc<ProxyMetrics>,
}

impl RequestHandler {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<dyn ResponseCache>,
        metrics: Arc<ProxyMetrics>,
        connect_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            registry,
            cache,
            client,
            metrics,
        })
    }

    /// Handle one request. Never fails: every error path maps to a
    /// response, and locally generated 4xx/5xx are counted as request
    /// errors.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let _guard = Arc::clone(&self.metrics).connection_guard();
        self.metrics.incr_requests();
        let started = Instant::now();

        let response = self.forward(req).await;

        self.metrics.observe_latency(started.elapsed());
        response
    }

    async fn forward(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();

        let Some(selector) = host_selector(&parts.headers) else {
            info!("Rejected request without usable Host header");
            return self.client_error(StatusCode::BAD_REQUEST, "Host header is required");
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let cache_key = format!("{selector}:{}:{}", parts.method, path_and_query);

        if let Some(cached) = self.cache.get(&cache_key) {
            debug!(key = %cache_key, "Cache hit");
            return Response::new(Full::new(cached));
        }

        let backend = match self.registry.next(&selector).await {
            Ok(backend) => backend,
            Err(e) => {
                info!(selector = %selector, error = %e, "No backend available");
                return self.client_error(StatusCode::SERVICE_UNAVAILABLE, "No backend available");
            }
        };

        let request_body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                return self.client_error(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let url = format!("{}{}", backend.trim_end_matches('/'), path_and_query);
        debug!(selector = %selector, url = %url, "Forwarding request");

        // Relay the client's header set; the body length is recomputed
        // from the collected bytes.
        let mut headers = parts.headers.clone();
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);

        let upstream = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(request_body)
            .send()
            .await;

        let upstream = match upstream {
            Ok(response) => response,
            Err(e) => {
                warn!(backend = %backend, error = %e, "Upstream request failed");
                return self.client_error(StatusCode::BAD_GATEWAY, "Failed to connect to backend");
            }
        };

        let status = upstream.status();
        let response_headers = upstream.headers().clone();
        let response_body = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(backend = %backend, error = %e, "Failed to read backend response");
                return self.client_error(StatusCode::BAD_GATEWAY, "Failed to read backend response");
            }
        };

        self.cache.put(&cache_key, response_body.clone());
        debug!(key = %cache_key, bytes = response_body.len(), "Response cached");

        let mut response = Response::new(Full::new(response_body));
        *response.status_mut() = status;
        for (name, value) in response_headers.iter() {
            if name == header::CONTENT_LENGTH
                || name == header::TRANSFER_ENCODING
                || name == header::CONNECTION
            {
                continue;
            }
            response.headers_mut().append(name, value.clone());
        }
        response
    }

    fn client_error(&self, status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
        self.metrics.incr_errors();
        let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
        *response.status_mut() = status;
        response
    }
}

/// Derive the routing selector from the `Host` header: lowercased, port
/// stripped. Returns `None` when the header is absent or unusable.
fn host_selector(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?.trim();
    let host = strip_port(host);
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

/// Strip a trailing `:port` from a host, leaving bracketed IPv6 literals
/// intact.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port))
                if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
            {
                name
            }
            _ => host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with_host(host: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_str(host).unwrap());
        headers
    }

    #[test]
    fn test_host_selector_lowercases() {
        let headers = headers_with_host("API.Test");
        assert_eq!(host_selector(&headers).unwrap(), "api.test");
    }

    #[test]
    fn test_host_selector_strips_port() {
        let headers = headers_with_host("api.test:8443");
        assert_eq!(host_selector(&headers).unwrap(), "api.test");
    }

    #[test]
    fn test_host_selector_missing() {
        assert!(host_selector(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_strip_port_ipv6() {
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:notaport"), "example.com:notaport");
    }
}
