//! Reverse-proxy load balancer for libris API instances.
//!
//! A front-end listener forwards every request round-robin to the
//! healthy subset of a fixed backend list. A background prober drives
//! the health state; forwarding itself can also take a backend out of
//! rotation when a connection attempt fails.

pub mod balancer;
pub mod forward;
pub mod health;

pub use balancer::{Backend, BackendPool, BackendStats};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Proxy configuration, environment-driven.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port the proxy listens on.
    pub port: u16,
    /// Backend base URLs.
    pub backends: Vec<String>,
    /// Seconds between health probe rounds.
    pub health_interval: f64,
    /// Per-probe timeout in seconds.
    pub health_timeout: f64,
    /// TCP connect timeout for forwarded requests, seconds.
    pub connect_timeout: f64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            backends: vec![
                "http://127.0.0.1:8080".to_string(),
                "http://127.0.0.1:8081".to_string(),
            ],
            health_interval: 2.0,
            health_timeout: 1.0,
            connect_timeout: 2.0,
        }
    }
}

impl ProxyConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = std::env::var("LIBRIS_PROXY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.port = port;
        }

        if let Ok(list) = std::env::var("LIBRIS_BACKENDS") {
            let backends: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !backends.is_empty() {
                config.backends = backends;
            }
        }

        if let Some(secs) = std::env::var("LIBRIS_HEALTH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.health_interval = secs;
        }

        if let Some(secs) = std::env::var("LIBRIS_HEALTH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.health_timeout = secs;
        }

        config
    }
}

/// Shared proxy state: the backend pool and the forwarding client.
pub struct ProxyState {
    pub backends: Arc<BackendPool>,
    pub client: reqwest::Client,
}

impl ProxyState {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            backends: Arc::new(BackendPool::new(config.backends.iter().cloned())),
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs_f64(config.connect_timeout))
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

/// Build the proxy router: own stats endpoint plus the catch-all
/// forwarder.
pub fn app(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/proxy/stats", get(forward::stats))
        .fallback(forward::forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the proxy until SIGINT/SIGTERM.
pub async fn run_proxy(config: ProxyConfig) -> anyhow::Result<()> {
    let state = Arc::new(ProxyState::new(&config));

    let prober = tokio::spawn(health::run_prober(
        Arc::clone(&state.backends),
        state.client.clone(),
        Duration::from_secs_f64(config.health_interval),
        Duration::from_secs_f64(config.health_timeout),
    ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(port = config.port, "libris proxy listening");
    for backend in &config.backends {
        info!(backend = %backend, "balancing to");
    }

    axum::serve(
        listener,
        app(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    prober.abort();
    info!("proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_process_layout() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(
            config.backends,
            vec!["http://127.0.0.1:8080", "http://127.0.0.1:8081"]
        );
    }
}
