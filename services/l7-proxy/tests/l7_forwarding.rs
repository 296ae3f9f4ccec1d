//! End-to-end tests for the TLS-terminating L7 data plane.


use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use harness::{tls_client_connect, HttpBackend, ProxyHandle};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_l7_forwards_and_caches() {
    let backend = HttpBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn().await.unwrap();

    proxy
        .registry
        .register("api.test", &backend.url())
        .await
        .unwrap();

    let client = proxy.https_client(&["api.test"]);

    let first = client
        .get(proxy.url("api.test", "/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.text().await.unwrap(), "v1");
    assert_eq!(backend.hit_count(), 1);

    // Second identical request is served from the cache: the backend
    // records no further call.
    let second = client
        .get(proxy.url("api.test", "/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.text().await.unwrap(), "v1");
    assert_eq!(backend.hit_count(), 1);
}

#[tokio::test]
async fn test_l7_cache_keys_on_method() {
    let backend = HttpBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn().await.unwrap();

    proxy
        .registry
        .register("api.test", &backend.url())
        .await
        .unwrap();

    let client = proxy.https_client(&["api.test"]);

    client
        .get(proxy.url("api.test", "/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(backend.hit_count(), 1);

    // Same URL, different method: must not be served from the GET's entry.
    client
        .post(proxy.url("api.test", "/x"))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(backend.hit_count(), 2);
}

#[tokio::test]
async fn test_l7_round_robin_on_cache_misses() {
    let backend_a = HttpBackend::spawn_with_body("from-a").await.unwrap();
    let backend_b = HttpBackend::spawn_with_body("from-b").await.unwrap();
    let proxy = ProxyHandle::spawn().await.unwrap();

    proxy
        .registry
        .register("api.test", &backend_a.url())
        .await
        .unwrap();
    proxy
        .registry
        .register("api.test", &backend_b.url())
        .await
        .unwrap();

    let client = proxy.https_client(&["api.test"]);

    // Distinct paths, so every request misses the cache and advances the
    // round-robin cursor.
    let mut bodies = Vec::new();
    for i in 0..4 {
        let body = client
            .get(proxy.url("api.test", &format!("/miss-{i}")))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        bodies.push(body);
    }

    assert_eq!(bodies, vec!["from-a", "from-b", "from-a", "from-b"]);
}

#[tokio::test]
async fn test_l7_no_backend_returns_503() {
    let proxy = ProxyHandle::spawn().await.unwrap();
    let client = proxy.https_client(&["api.test"]);

    let response = client
        .get(proxy.url("api.test", "/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(proxy.metrics.request_errors(), 1);
}

#[tokio::test]
async fn test_l7_unreachable_backend_returns_502() {
    let proxy = ProxyHandle::spawn().await.unwrap();

    // A port nothing listens on.
    proxy
        .registry
        .register("api.test", "http://127.0.0.1:9")
        .await
        .unwrap();

    let client = proxy.https_client(&["api.test"]);
    let response = client
        .get(proxy.url("api.test", "/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_l7_relays_status_and_headers() {
    let backend = HttpBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn().await.unwrap();

    proxy
        .registry
        .register("api.test", &backend.url())
        .await
        .unwrap();

    let client = proxy.https_client(&["api.test"]);
    let response = client
        .get(proxy.url("api.test", "/created"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    assert_eq!(
        response.headers().get("x-upstream").unwrap(),
        "weft-test"
    );
    assert_eq!(response.text().await.unwrap(), "made");
}

#[tokio::test]
async fn test_l7_missing_host_returns_400() {
    let proxy = ProxyHandle::spawn().await.unwrap();

    let mut stream = tls_client_connect(proxy.listen_addr, "api.test", &proxy.cert_der)
        .await
        .unwrap();

    // HTTP/1.0 request without a Host header.
    stream
        .write_all(b"GET / HTTP/1.0\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains(" 400 "), "unexpected response: {response}");
}

#[tokio::test]
async fn test_control_plane_registration_flow() {
    let backend = HttpBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn().await.unwrap();

    let control = reqwest::Client::new();
    let response = control
        .post(format!("http://{}/register-backend", proxy.control_addr))
        .json(&serde_json::json!({
            "host": "api.test",
            "backend": backend.url(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .text()
        .await
        .unwrap()
        .contains("registered successfully"));

    let client = proxy.https_client(&["api.test"]);
    let body = client
        .get(proxy.url("api.test", "/x"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "v1");
}

#[tokio::test]
async fn test_control_plane_validation() {
    let proxy = ProxyHandle::spawn().await.unwrap();
    let client = reqwest::Client::new();
    let endpoint = format!("http://{}/register-backend", proxy.control_addr);

    // Empty backend
    let response = client
        .post(&endpoint)
        .body(r#"{"host":"api.test","backend":""}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Malformed JSON
    let response = client.post(&endpoint).body("{").send().await.unwrap();
    assert_eq!(response.status(), 400);

    // Wrong method
    let response = client.get(&endpoint).send().await.unwrap();
    assert_eq!(response.status(), 405);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_contract_names() {
    let backend = HttpBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn().await.unwrap();

    proxy
        .registry
        .register("api.test", &backend.url())
        .await
        .unwrap();

    let client = proxy.https_client(&["api.test"]);
    client
        .get(proxy.url("api.test", "/x"))
        .send()
        .await
        .unwrap();

    let rendered = reqwest::get(format!("http://{}/metrics", proxy.metrics_addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(rendered.contains("total_requests 1"));
    assert!(rendered.contains("request_errors 0"));
    for name in [
        "active_connections",
        "task_count",
        "cpu_usage_percent",
        "memory_usage_bytes",
        "request_latency_seconds_count",
    ] {
        assert!(rendered.contains(name), "missing metric {name}");
    }
}
