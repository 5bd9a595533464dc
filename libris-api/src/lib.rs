//! Library reservation API instance.
//!
//! One instance composes an LRU book cache, a bounded SQLite connection
//! pool, a bounded reservation queue drained by a batch worker group,
//! and an SLA monitor, all owned by a single [`InstanceContext`] and
//! exposed over HTTP. Each instance binds exactly one database file
//! derived from its listen port, so instances are fully isolated and an
//! orchestrator can run several side by side.
//!
//! ```text
//! client ──► routes ──► cache / pool ──► SQLite      (read path)
//!        └─► validate ─► pending row ─► queue        (write path)
//!                                         │ batch_interval
//!                                  ┌──────▼──────┐
//!                                  │  dispatcher │  xxh3(isbn) % workers
//!                                  └──┬───────┬──┘
//!                                 worker 0 … worker N
//!                                     │  BEGIN IMMEDIATE
//!                                     ▼
//!                         confirm/reject + cache invalidate
//!                                     ▼
//!                              SLA latency sample
//! ```

pub mod batcher;
pub mod cache;
pub mod db;
pub mod error;
pub mod model;
pub mod queue;
pub mod routes;
pub mod sla;
pub mod state;

pub use state::InstanceContext;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use libris_core::Config;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Build the instance router. Exposed separately from [`run_instance`]
/// so tests can serve an instance on an ephemeral port.
pub fn app(ctx: Arc<InstanceContext>) -> Router {
    Router::new()
        .route("/", get(routes::root))
        .route("/books", get(routes::list_books).post(routes::create_book))
        .route("/books/:isbn", get(routes::get_book))
        .route("/users", post(routes::create_user))
        .route("/users/:user_id", get(routes::get_user))
        .route("/reservations", post(routes::create_reservation))
        .route("/reservations/my/:user_id", get(routes::my_reservations))
        .route("/sla", get(routes::sla))
        .route("/metrics", get(routes::metrics))
        .route("/health", get(routes::health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Handles to the instance's background loops, stopped as a unit.
pub struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Spawn the batcher, worker group, heartbeat, depth sampler, and SLA
/// reporter for an instance.
pub fn spawn_background(ctx: &Arc<InstanceContext>) -> Background {
    let (shutdown, rx) = watch::channel(false);
    let mut handles = batcher::spawn(ctx.clone(), rx.clone());
    handles.push(tokio::spawn(sla::run_heartbeat(ctx.clone(), rx.clone())));
    handles.push(tokio::spawn(sla::run_depth_sampler(ctx.clone(), rx.clone())));
    handles.push(tokio::spawn(sla::run_reporter(ctx.clone(), rx)));
    Background { shutdown, handles }
}

impl Background {
    /// Signal every loop and wait for them to finish. The batcher does a
    /// final queue drain bounded by `shutdown_grace` before stopping.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Run one API instance until SIGINT/SIGTERM: serve HTTP, then stop
/// accepting, drain the queue, and close the pool.
pub async fn run_instance(config: Config, port: u16) -> anyhow::Result<()> {
    let ctx = Arc::new(InstanceContext::new(config, port)?);
    let background = spawn_background(&ctx);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(
        port,
        environment = %ctx.config.environment,
        workers = ctx.config.worker_threads,
        "libris API instance listening"
    );

    axum::serve(listener, app(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown signal received, draining queue");
    background.shutdown().await;
    ctx.pool.close_all();
    info!(port, "instance stopped");
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM.
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
