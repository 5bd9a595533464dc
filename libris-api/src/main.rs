//! API instance binary.
//!
//! Loads the per-environment config (fatal on a malformed file), wires
//! tracing, and serves one instance on `PORT` (default 8080).

use libris_core::{port_from_env, Config};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config comes first: its log_level seeds the default filter.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "libris_api={level},libris_core={level},tower_http=info",
            level = config.log_level
        ))
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let port = port_from_env(8080);
    libris_api::run_instance(config, port).await
}
