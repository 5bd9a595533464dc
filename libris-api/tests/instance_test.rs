//! End-to-end tests against a full in-process API instance.
//!
//! Each test binds an ephemeral port, builds an [`InstanceContext`] for
//! it (which also selects a unique database file), and drives the real
//! HTTP surface with reqwest.

use std::sync::Arc;
use std::time::Duration;

use libris_api::{app, spawn_background, Background, InstanceContext};
use libris_core::Config;
use serde_json::{json, Value};

struct TestInstance {
    base_url: String,
    ctx: Arc<InstanceContext>,
    background: Background,
    server: tokio::task::JoinHandle<()>,
}

impl TestInstance {
    async fn stop(self) {
        self.background.shutdown().await;
        self.server.abort();
        self.ctx.pool.close_all();
    }
}

async fn start_instance(tweak: impl FnOnce(&mut Config)) -> TestInstance {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = std::env::temp_dir().join(format!(
        "libris_instance_test_{}_{port}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);

    let mut config = Config::default();
    config.data_dir = dir.to_str().unwrap().to_string();
    config.worker_threads = 2;
    config.batch_interval = 0.05;
    config.batch_size = 10;
    config.shutdown_grace = 2.0;
    tweak(&mut config);

    let ctx = Arc::new(InstanceContext::new(config, port).unwrap());
    let background = spawn_background(&ctx);
    let router = app(ctx.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestInstance {
        base_url: format!("http://127.0.0.1:{port}"),
        ctx,
        background,
        server,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn post_json(url: &str, body: Value) -> reqwest::Response {
    client().post(url).json(&body).send().await.unwrap()
}

async fn get_json(url: &str) -> Value {
    client()
        .get(url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn add_book(base: &str, isbn: &str, copies: u32) -> reqwest::Response {
    post_json(
        &format!("{base}/books"),
        json!({
            "isbn": isbn,
            "title": format!("Title {isbn}"),
            "author": "Author",
            "category": "Testing",
            "total_copies": copies,
        }),
    )
    .await
}

async fn add_user(base: &str, user_id: &str) -> reqwest::Response {
    post_json(
        &format!("{base}/users"),
        json!({
            "user_id": user_id,
            "name": format!("User {user_id}"),
            "email": format!("{user_id}@example.com"),
            "membership_type": "student",
        }),
    )
    .await
}

async fn reserve(base: &str, user_id: &str, isbn: &str) -> reqwest::Response {
    post_json(
        &format!("{base}/reservations"),
        json!({"user_id": user_id, "isbn": isbn}),
    )
    .await
}

/// Poll the user's reservations until none are pending (or time out).
async fn wait_until_processed(base: &str, user_id: &str) -> Vec<Value> {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let reservations = get_json(&format!("{base}/reservations/my/{user_id}")).await;
        let list = reservations.as_array().unwrap().clone();
        let pending = list.iter().any(|r| r["status"] == "pending");
        if !pending && !list.is_empty() {
            return list;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "reservations still pending after 5s: {list:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn reservation_happy_path() {
    let instance = start_instance(|_| {}).await;
    let base = &instance.base_url;

    assert_eq!(add_book(base, "HAPPY-1", 1).await.status(), 201);
    assert_eq!(add_user(base, "happy_user").await.status(), 201);

    let response = reserve(base, "happy_user", "HAPPY-1").await;
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    assert!(body["reservation_id"].as_i64().unwrap() >= 1);

    let processed = wait_until_processed(base, "happy_user").await;
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0]["status"], "confirmed");

    let book = get_json(&format!("{base}/books/HAPPY-1")).await;
    assert_eq!(book["available_copies"], 0);

    instance.stop().await;
}

#[tokio::test]
async fn overbooking_is_prevented() {
    let instance = start_instance(|_| {}).await;
    let base = &instance.base_url;

    assert_eq!(add_book(base, "SCARCE-1", 1).await.status(), 201);
    for user in ["ob_u1", "ob_u2", "ob_u3", "ob_u4", "ob_u5"] {
        assert_eq!(add_user(base, user).await.status(), 201);
        assert_eq!(reserve(base, user, "SCARCE-1").await.status(), 202);
    }

    let mut confirmed = 0;
    let mut rejected = 0;
    for user in ["ob_u1", "ob_u2", "ob_u3", "ob_u4", "ob_u5"] {
        let processed = wait_until_processed(base, user).await;
        match processed[0]["status"].as_str().unwrap() {
            "confirmed" => confirmed += 1,
            "rejected" => {
                assert_eq!(processed[0]["reason"], "no copies available");
                rejected += 1;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(confirmed, 1);
    assert_eq!(rejected, 4);

    let book = get_json(&format!("{base}/books/SCARCE-1")).await;
    assert_eq!(book["available_copies"], 0);

    instance.stop().await;
}

#[tokio::test]
async fn queue_full_returns_503_with_retry_after() {
    // Long batch interval so nothing drains during the test.
    let instance = start_instance(|config| {
        config.max_queue = 2;
        config.batch_interval = 30.0;
    })
    .await;
    let base = &instance.base_url;

    assert_eq!(add_book(base, "FULL-1", 10).await.status(), 201);
    assert_eq!(add_user(base, "full_user").await.status(), 201);

    assert_eq!(reserve(base, "full_user", "FULL-1").await.status(), 202);
    assert_eq!(reserve(base, "full_user", "FULL-1").await.status(), 202);

    let response = reserve(base, "full_user", "FULL-1").await;
    assert_eq!(response.status(), 503);
    assert!(response.headers().contains_key("retry-after"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "queue_full");

    // The overflow row was flipped, not left pending.
    let mine = get_json(&format!("{base}/reservations/my/full_user")).await;
    let list = mine.as_array().unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list[0]["status"], "rejected");
    assert_eq!(list[0]["reason"], "queue full");

    instance.stop().await;
}

#[tokio::test]
async fn cached_read_reflects_confirmed_reservation() {
    let instance = start_instance(|_| {}).await;
    let base = &instance.base_url;

    assert_eq!(add_book(base, "CACHE-1", 2).await.status(), 201);
    assert_eq!(add_user(base, "cache_user").await.status(), 201);

    // Miss, then hit.
    let first = get_json(&format!("{base}/books/CACHE-1")).await;
    assert_eq!(first["available_copies"], 2);
    let _second = get_json(&format!("{base}/books/CACHE-1")).await;
    let metrics = get_json(&format!("{base}/metrics")).await;
    assert!(metrics["cache"]["hits"].as_u64().unwrap() >= 1);

    // A confirmed reservation invalidates the entry, so the next read
    // sees the decremented row instead of the cached copy.
    assert_eq!(reserve(base, "cache_user", "CACHE-1").await.status(), 202);
    wait_until_processed(base, "cache_user").await;

    let after = get_json(&format!("{base}/books/CACHE-1")).await;
    assert_eq!(after["available_copies"], 1);

    instance.stop().await;
}

#[tokio::test]
async fn posted_book_round_trips() {
    let instance = start_instance(|_| {}).await;
    let base = &instance.base_url;

    let response = add_book(base, "ROUND-1", 4).await;
    assert_eq!(response.status(), 201);
    let posted: Value = response.json().await.unwrap();

    let fetched = get_json(&format!("{base}/books/ROUND-1")).await;
    assert_eq!(posted, fetched);
    assert_eq!(fetched["total_copies"], 4);
    assert_eq!(fetched["available_copies"], 4);

    instance.stop().await;
}

#[tokio::test]
async fn validation_and_conflict_errors() {
    let instance = start_instance(|_| {}).await;
    let base = &instance.base_url;

    // Unknown references on the reservation path are 400, not 404.
    assert_eq!(add_user(base, "val_user").await.status(), 201);
    let response = reserve(base, "val_user", "NO-SUCH-BOOK").await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "validation");

    let response = reserve(base, "ghost_user", "978-0132350884").await;
    assert_eq!(response.status(), 400);

    // Duplicates conflict.
    assert_eq!(add_book(base, "DUP-1", 1).await.status(), 201);
    let response = add_book(base, "DUP-1", 1).await;
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "conflict");

    let response = add_user(base, "val_user").await;
    assert_eq!(response.status(), 409);

    // Unknown membership tier is rejected at the boundary.
    let response = post_json(
        &format!("{base}/users"),
        json!({
            "user_id": "bad_member",
            "name": "X",
            "email": "x@example.com",
            "membership_type": "alumni",
        }),
    )
    .await;
    assert_eq!(response.status(), 400);

    // Unknown book lookup is a plain 404.
    let response = client()
        .get(format!("{base}/books/NOT-A-BOOK"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    instance.stop().await;
}

#[tokio::test]
async fn category_filter_on_book_listing() {
    let instance = start_instance(|_| {}).await;
    let base = &instance.base_url;

    // The seeded catalog ships two Software Architecture titles.
    let filtered = get_json(&format!("{base}/books?category=Software%20Architecture")).await;
    let list = filtered.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert!(list
        .iter()
        .all(|b| b["category"] == "Software Architecture"));

    let all = get_json(&format!("{base}/books")).await;
    assert!(all.as_array().unwrap().len() >= 8);

    instance.stop().await;
}

#[tokio::test]
async fn monitoring_endpoints_have_expected_shape() {
    let instance = start_instance(|_| {}).await;
    let base = &instance.base_url;

    let health = get_json(&format!("{base}/health")).await;
    assert_eq!(health["status"], "healthy");
    assert!(health["port"].as_u64().is_some());
    assert!(health["queue_depth"].as_u64().is_some());
    assert!(health["uptime_seconds"].as_u64().is_some());

    let sla = get_json(&format!("{base}/sla")).await;
    assert!(sla["p95"].as_f64().is_some());
    assert!(sla["uptime"].as_f64().unwrap() > 0.0);
    assert!(sla["targets_met"]["latency_p95"].as_bool().is_some());
    assert!(sla["targets_met"]["uptime"].as_bool().is_some());
    assert!(sla["targets_met"]["queue_depth"].as_bool().is_some());

    let metrics = get_json(&format!("{base}/metrics")).await;
    assert!(metrics["cache"]["capacity"].as_u64().is_some());
    assert!(metrics["pool"]["max"].as_u64().is_some());
    assert!(metrics["pool"]["opened"].as_u64().unwrap() >= 2);
    assert!(metrics["queue"]["max"].as_u64().is_some());
    assert!(metrics["latency"]["count"].as_u64().is_some());

    instance.stop().await;
}

#[tokio::test]
async fn sla_report_is_written_on_interval() {
    // ~120ms report interval (the config value is in minutes).
    let instance = start_instance(|config| {
        config.sla_report_interval = 0.002;
    })
    .await;
    let base = &instance.base_url;

    assert_eq!(add_book(base, "REPORT-1", 1).await.status(), 201);
    assert_eq!(add_user(base, "report_user").await.status(), 201);
    assert_eq!(reserve(base, "report_user", "REPORT-1").await.status(), 202);
    wait_until_processed(base, "report_user").await;

    let report_path =
        std::path::Path::new(&instance.ctx.config.data_dir).join("sla_report.txt");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if report_path.exists() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no SLA report after 5s"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let report = std::fs::read_to_string(&report_path).unwrap();
    assert!(report.contains("SLA Report - "));
    assert!(report.contains("Reservation Processing SLA"));
    assert!(report.contains("System Availability SLA"));
    assert!(report.contains("Queue Depth SLA"));
    assert!(report.contains("SLA Met:"));

    instance.stop().await;
}

#[tokio::test]
async fn two_instances_are_isolated() {
    let a = start_instance(|_| {}).await;
    let b = start_instance(|_| {}).await;

    assert_eq!(add_book(&a.base_url, "ISO-1", 1).await.status(), 201);

    // The book exists only on instance A.
    let response = client()
        .get(format!("{}/books/ISO-1", b.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    a.stop().await;
    b.stop().await;
}
