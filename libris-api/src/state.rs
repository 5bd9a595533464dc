//! Per-instance application state.

use std::time::Duration;

use libris_core::Config;
use tracing::info;

use crate::cache::BookCache;
use crate::db::{self, ConnectionPool, DbError};
use crate::queue::ReservationQueue;
use crate::sla::SlaMonitor;

/// Everything one API instance owns: configuration, cache, pool, queue,
/// and SLA monitor. Handlers and workers receive this behind an `Arc`;
/// there is no process-global state, so several instances can coexist in
/// one process (the integration tests rely on that).
pub struct InstanceContext {
    pub config: Config,
    pub port: u16,
    pub cache: BookCache,
    pub pool: ConnectionPool,
    pub queue: ReservationQueue,
    pub monitor: SlaMonitor,
}

impl InstanceContext {
    /// Initialize the instance: create the data directory, run schema
    /// migration + seeding on this port's database file, and open the
    /// connection pool.
    pub fn new(config: Config, port: u16) -> Result<Self, DbError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| DbError::Open(format!("create data dir: {e}")))?;

        let db_path = db::database_path(&config.data_dir, port);
        db::initialize(&db_path)?;

        let pool = ConnectionPool::open(&db_path, config.min_connections, config.max_connections)?;
        info!(
            port,
            db = %db_path.display(),
            environment = %config.environment,
            "instance context initialized"
        );

        Ok(Self {
            cache: BookCache::new(config.cache_size),
            queue: ReservationQueue::new(config.max_queue),
            monitor: SlaMonitor::new(
                config.latency_window,
                config.heartbeat_interval_duration(),
            ),
            pool,
            port,
            config,
        })
    }

    /// Timeout applied to every pool acquisition.
    pub fn acquire_timeout(&self) -> Duration {
        self.config.acquire_timeout_duration()
    }
}
