//! Integration tests driving the proxy against in-process backends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use libris_proxy::{app, health, ProxyConfig, ProxyState};
use serde_json::{json, Value};

struct TestBackend {
    url: String,
    hits: Arc<AtomicU64>,
    server: tokio::task::JoinHandle<()>,
}

impl TestBackend {
    fn kill(&self) {
        self.server.abort();
    }
}

async fn ping(State(hits): State<Arc<AtomicU64>>, headers: HeaderMap) -> (HeaderMap, Json<Value>) {
    hits.fetch_add(1, Ordering::Relaxed);
    let mut response_headers = HeaderMap::new();
    response_headers.insert("x-backend-saw-echo", "yes".parse().unwrap());
    let forwarded_for = headers
        .get("x-forwarded-for")
        .map(|v| v.to_str().unwrap_or("").to_string());
    (
        response_headers,
        Json(json!({"pong": true, "x_forwarded_for": forwarded_for})),
    )
}

async fn start_backend() -> TestBackend {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let hits = Arc::new(AtomicU64::new(0));

    let router = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy"})) }))
        .route("/ping", get(ping))
        .with_state(hits.clone());

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestBackend { url, hits, server }
}

async fn start_proxy(backends: Vec<String>) -> (String, Arc<ProxyState>, tokio::task::JoinHandle<()>) {
    let config = ProxyConfig {
        backends,
        connect_timeout: 1.0,
        ..ProxyConfig::default()
    };
    let state = Arc::new(ProxyState::new(&config));

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let router = app(Arc::clone(&state));
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (url, state, server)
}

fn force_healthy(state: &ProxyState) {
    for backend in state.backends.backends() {
        backend.record_probe_success();
        backend.record_probe_success();
    }
}

#[tokio::test]
async fn round_robin_splits_traffic_evenly() {
    let a = start_backend().await;
    let b = start_backend().await;
    let (proxy_url, state, _server) = start_proxy(vec![a.url.clone(), b.url.clone()]).await;
    force_healthy(&state);

    let client = reqwest::Client::new();
    for _ in 0..10 {
        let response = client.get(format!("{proxy_url}/ping")).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }

    assert_eq!(a.hits.load(Ordering::Relaxed), 5);
    assert_eq!(b.hits.load(Ordering::Relaxed), 5);
}

#[tokio::test]
async fn response_headers_and_body_pass_through() {
    let a = start_backend().await;
    let (proxy_url, state, _server) = start_proxy(vec![a.url.clone()]).await;
    force_healthy(&state);

    let response = reqwest::Client::new()
        .get(format!("{proxy_url}/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-backend-saw-echo").unwrap(),
        "yes"
    );
    assert_eq!(
        response.headers().get("x-served-by").unwrap().to_str().unwrap(),
        a.url
    );

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["pong"], true);
    // The proxy stamped the client address onto the forwarded request.
    assert!(body["x_forwarded_for"].as_str().unwrap().contains("127.0.0.1"));
}

#[tokio::test]
async fn failover_retries_the_other_backend() {
    let a = start_backend().await;
    let b = start_backend().await;
    let (proxy_url, state, _server) = start_proxy(vec![a.url.clone(), b.url.clone()]).await;
    force_healthy(&state);

    b.kill();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = reqwest::Client::new();
    for _ in 0..6 {
        let response = client.get(format!("{proxy_url}/ping")).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("x-served-by").unwrap().to_str().unwrap(),
            a.url
        );
    }

    // Every request landed on the survivor; the dead backend was taken
    // out of rotation by the first failed forward.
    assert_eq!(a.hits.load(Ordering::Relaxed), 6);
    assert_eq!(state.backends.healthy_count(), 1);
}

#[tokio::test]
async fn no_healthy_backend_returns_503() {
    let (proxy_url, _state, _server) =
        start_proxy(vec!["http://127.0.0.1:1".to_string()]).await;

    let response = reqwest::Client::new()
        .get(format!("{proxy_url}/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "no_backend");
}

#[tokio::test]
async fn prober_flips_backends_both_ways() {
    let a = start_backend().await;
    let config = ProxyConfig {
        backends: vec![a.url.clone()],
        connect_timeout: 1.0,
        ..ProxyConfig::default()
    };
    let state = Arc::new(ProxyState::new(&config));

    let prober = tokio::spawn(health::run_prober(
        Arc::clone(&state.backends),
        state.client.clone(),
        Duration::from_millis(50),
        Duration::from_millis(500),
    ));

    // Two successful probes mark it healthy.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while state.backends.healthy_count() == 0 {
        assert!(std::time::Instant::now() < deadline, "backend never became healthy");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Kill it; two failed probes take it back out.
    a.kill();
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while state.backends.healthy_count() != 0 {
        assert!(std::time::Instant::now() < deadline, "backend never became unhealthy");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    prober.abort();
}

#[tokio::test]
async fn post_bodies_are_forwarded() {
    // An instance-shaped echo backend for POST.
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/echo",
            axum::routing::post(|Json(body): Json<Value>| async move { Json(body) }),
        );
    let _server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let (proxy_url, state, _proxy_server) = start_proxy(vec![url]).await;
    force_healthy(&state);

    let body = json!({"user_id": "U1", "isbn": "978-0132350884"});
    let response = reqwest::Client::new()
        .post(format!("{proxy_url}/echo"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed, body);
}

#[tokio::test]
async fn proxy_stats_reports_per_backend_counts() {
    let a = start_backend().await;
    let b = start_backend().await;
    let (proxy_url, state, _server) = start_proxy(vec![a.url.clone(), b.url.clone()]).await;
    force_healthy(&state);

    let client = reqwest::Client::new();
    for _ in 0..4 {
        client.get(format!("{proxy_url}/ping")).send().await.unwrap();
    }

    let stats: Value = client
        .get(format!("{proxy_url}/proxy/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(stats["healthy_backends"], 2);
    let backends = stats["backends"].as_array().unwrap();
    assert_eq!(backends.len(), 2);
    let total: u64 = backends
        .iter()
        .map(|b| b["forwarded"].as_u64().unwrap())
        .sum();
    assert_eq!(total, 4);
}
