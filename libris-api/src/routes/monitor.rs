//! Monitoring endpoints: `/sla`, `/metrics`, `/health`, and the banner.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::InstanceContext;

/// GET / — service banner with the endpoint map.
pub async fn root(State(ctx): State<Arc<InstanceContext>>) -> Json<Value> {
    Json(json!({
        "service": "libris",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": ctx.config.environment,
        "port": ctx.port,
        "endpoints": {
            "books": ["/books", "/books/{isbn}"],
            "users": ["/users", "/users/{user_id}"],
            "reservations": ["/reservations", "/reservations/my/{user_id}"],
            "monitoring": ["/sla", "/metrics", "/health"],
        },
    }))
}

/// GET /sla — current compliance against the three targets.
pub async fn sla(State(ctx): State<Arc<InstanceContext>>) -> Json<Value> {
    let snapshot = ctx.monitor.snapshot();
    Json(json!({
        "p95": snapshot.p95,
        "p99": snapshot.p99,
        "mean": snapshot.mean,
        "count": snapshot.count,
        "uptime": snapshot.uptime_ratio,
        "uptime_seconds": snapshot.uptime_seconds,
        "queue_depth": snapshot.queue_depth,
        "targets_met": snapshot.targets_met,
    }))
}

/// GET /metrics — detailed component counters.
pub async fn metrics(State(ctx): State<Arc<InstanceContext>>) -> Json<Value> {
    Json(json!({
        "environment": ctx.config.environment,
        "cache": ctx.cache.stats().await,
        "pool": ctx.pool.stats(),
        "queue": {
            "depth": ctx.queue.depth().await,
            "max": ctx.queue.max(),
        },
        "latency": ctx.monitor.latency_summary(),
    }))
}

/// GET /health — probed by the reverse proxy.
pub async fn health(State(ctx): State<Arc<InstanceContext>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "port": ctx.port,
        "queue_depth": ctx.queue.depth().await,
        "uptime_seconds": ctx.monitor.uptime_seconds(),
    }))
}
