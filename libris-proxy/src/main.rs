//! Reverse proxy binary.

use libris_proxy::{run_proxy, ProxyConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("libris_proxy=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    run_proxy(ProxyConfig::from_env()).await
}
