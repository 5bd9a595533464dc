//! libris orchestrator.
//!
//! `libris start` launches the configured number of API instances as
//! child processes (distinct ports, distinct database files), waits for
//! each to report healthy, then starts the reverse proxy in front of
//! them and supervises the lot. On SIGINT/SIGTERM children are stopped
//! in reverse order — proxy first, then instances — each with the
//! configured grace period before a forced kill.

use std::path::PathBuf;
use std::process::Child;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use libris_core::{process, Config, Environment};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "libris", version, about = "Library reservation service orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start API instances behind the reverse proxy and supervise them
    Start {
        /// Number of API instances to launch
        #[arg(long, default_value_t = 2)]
        instances: u16,

        /// First instance port; instance i listens on base_port + i
        #[arg(long, default_value_t = 8080)]
        base_port: u16,

        /// Reverse proxy port
        #[arg(long, default_value_t = 8000)]
        proxy_port: u16,
    },
    /// Print the health of the proxy and every instance
    Status {
        #[arg(long, default_value_t = 2)]
        instances: u16,

        #[arg(long, default_value_t = 8080)]
        base_port: u16,

        #[arg(long, default_value_t = 8000)]
        proxy_port: u16,
    },
}

struct ManagedChild {
    name: String,
    child: Child,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("libris=info,libris_core=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match Cli::parse().command {
        Commands::Start {
            instances,
            base_port,
            proxy_port,
        } => start(instances, base_port, proxy_port).await,
        Commands::Status {
            instances,
            base_port,
            proxy_port,
        } => status(instances, base_port, proxy_port).await,
    }
}

/// Child binaries are expected next to the orchestrator binary, which
/// is where cargo puts workspace siblings.
fn sibling_binary(name: &str) -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot resolve own path")?;
    let dir = exe.parent().context("orchestrator binary has no parent dir")?;
    let path = dir.join(name);
    if !path.exists() {
        bail!("{name} not found at {}; build the full workspace first", path.display());
    }
    Ok(path)
}

async fn wait_healthy(client: &reqwest::Client, base_url: &str, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    let url = format!("{base_url}/health");
    while std::time::Instant::now() < deadline {
        if let Ok(response) = client
            .get(&url)
            .timeout(Duration::from_secs(1))
            .send()
            .await
        {
            if response.status().is_success() {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

async fn start(instances: u16, base_port: u16, proxy_port: u16) -> anyhow::Result<()> {
    if instances == 0 {
        bail!("need at least one instance");
    }

    let environment = Environment::from_env();
    // Fatal on a malformed config file; children load the same file.
    let config = Config::load()?;

    let api_bin = sibling_binary("libris-api")?;
    let proxy_bin = sibling_binary("libris-proxy")?;
    let client = reqwest::Client::new();

    let mut children: Vec<ManagedChild> = Vec::new();
    let mut backends = Vec::new();

    for i in 0..instances {
        let port = base_port + i;
        let child = process::spawn_supervised(
            api_bin.to_str().context("non-utf8 path")?,
            &[],
            &[
                ("PORT", port.to_string()),
                ("ENVIRONMENT", environment.as_str().to_string()),
            ],
        )
        .with_context(|| format!("failed to spawn instance on port {port}"))?;
        info!(port, pid = child.id(), "started API instance");
        children.push(ManagedChild {
            name: format!("instance:{port}"),
            child,
        });
        backends.push(format!("http://127.0.0.1:{port}"));
    }

    for (i, backend) in backends.iter().enumerate() {
        if !wait_healthy(&client, backend, Duration::from_secs(30)).await {
            for managed in children.iter_mut().rev() {
                process::shutdown_child(&mut managed.child, config.shutdown_grace_duration());
            }
            bail!("instance {} never became healthy", backends[i]);
        }
        info!(backend = %backend, "instance healthy");
    }

    let proxy = process::spawn_supervised(
        proxy_bin.to_str().context("non-utf8 path")?,
        &[],
        &[
            ("LIBRIS_PROXY_PORT", proxy_port.to_string()),
            ("LIBRIS_BACKENDS", backends.join(",")),
            ("ENVIRONMENT", environment.as_str().to_string()),
        ],
    )
    .context("failed to spawn proxy")?;
    info!(port = proxy_port, pid = proxy.id(), "started reverse proxy");
    // Proxy last in the list ⇒ first to be stopped.
    children.push(ManagedChild {
        name: format!("proxy:{proxy_port}"),
        child: proxy,
    });

    info!(
        instances,
        proxy_port,
        environment = environment.as_str(),
        "deployment up; Ctrl-C to stop"
    );

    supervise(&mut children).await;

    info!("shutting down children");
    let grace = config.shutdown_grace_duration();
    for managed in children.iter_mut().rev() {
        let outcome = process::shutdown_child(&mut managed.child, grace);
        if outcome.was_graceful() {
            info!(child = %managed.name, "stopped");
        } else {
            warn!(child = %managed.name, outcome = ?outcome, "forced stop");
        }
    }
    info!("all children stopped");
    Ok(())
}

/// Watch children until a shutdown signal arrives. An abnormal child
/// exit is logged; the orchestrator does not restart it.
async fn supervise(children: &mut Vec<ManagedChild>) {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            _ = ticker.tick() => {
                children.retain_mut(|managed| match managed.child.try_wait() {
                    Ok(Some(code)) => {
                        error!(child = %managed.name, %code, "child exited unexpectedly");
                        false
                    }
                    Ok(None) => true,
                    Err(e) => {
                        error!(child = %managed.name, error = %e, "failed to poll child");
                        true
                    }
                });
            }
        }
    }
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

async fn status(instances: u16, base_port: u16, proxy_port: u16) -> anyhow::Result<()> {
    let client = reqwest::Client::new();

    for i in 0..instances {
        let port = base_port + i;
        let url = format!("http://127.0.0.1:{port}/health");
        match client
            .get(&url)
            .timeout(Duration::from_secs(1))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                println!(
                    "instance {port}: healthy (queue_depth={}, uptime={}s)",
                    body["queue_depth"], body["uptime_seconds"]
                );
            }
            Ok(response) => println!("instance {port}: status {}", response.status()),
            Err(_) => println!("instance {port}: unreachable"),
        }
    }

    let url = format!("http://127.0.0.1:{proxy_port}/proxy/stats");
    match client
        .get(&url)
        .timeout(Duration::from_secs(1))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            println!(
                "proxy {proxy_port}: up ({} healthy backends)",
                body["healthy_backends"]
            );
            if let Some(backends) = body["backends"].as_array() {
                for backend in backends {
                    println!(
                        "  {} healthy={} forwarded={} errors={}",
                        backend["url"], backend["healthy"], backend["forwarded"], backend["errors"]
                    );
                }
            }
        }
        _ => println!("proxy {proxy_port}: unreachable"),
    }

    Ok(())
}
