//! Background health probing of backends.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::balancer::{Backend, BackendPool};

/// Probe every backend's `/health` on a fixed interval forever.
pub async fn run_prober(
    pool: Arc<BackendPool>,
    client: Client,
    interval: Duration,
    timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for backend in pool.backends() {
            probe(&client, backend, timeout).await;
        }
    }
}

/// One probe round trip. State flips are logged; steady states are not.
pub async fn probe(client: &Client, backend: &Backend, timeout: Duration) {
    let url = format!("{}/health", backend.url);
    let healthy_now = match client.get(&url).timeout(timeout).send().await {
        Ok(response) if response.status().is_success() => true,
        Ok(response) => {
            debug!(backend = %backend.url, status = %response.status(), "probe got non-success");
            false
        }
        Err(e) => {
            debug!(backend = %backend.url, error = %e, "probe failed");
            false
        }
    };

    let flipped = if healthy_now {
        backend.record_probe_success()
    } else {
        backend.record_probe_failure()
    };

    match flipped {
        Some(true) => info!(backend = %backend.url, "backend is healthy"),
        Some(false) => warn!(backend = %backend.url, "backend is unhealthy"),
        None => {}
    }
}
