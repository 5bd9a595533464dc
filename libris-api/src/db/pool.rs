//! Bounded SQLite connection pool.
//!
//! The pool opens `min` verified connections eagerly and grows on demand
//! up to `max`. A lease is a [`PooledConnection`] guard holding one of
//! `max` semaphore permits, so outstanding leases can never exceed the
//! bound; dropping the guard returns the connection on every exit path,
//! including panics inside blocking closures. Connections that observed
//! an I/O-level error are marked broken and closed on release instead of
//! being handed to another caller.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Error surface of pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no connection available within {timeout_ms}ms")]
    Exhausted { timeout_ms: u64 },

    #[error("connection pool is closed")]
    Closed,

    #[error("failed to open connection: {0}")]
    Open(#[source] rusqlite::Error),
}

/// Point-in-time pool counters, served under `/metrics`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub opened: usize,
    pub idle: usize,
    pub in_use: usize,
    pub min: usize,
    pub max: usize,
}

struct PoolInner {
    path: PathBuf,
    min: usize,
    max: usize,
    idle: Mutex<Vec<Connection>>,
    /// Total connections in existence (idle + leased).
    opened: AtomicUsize,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

/// Shareable handle to the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open a pool over the database at `path`, eagerly opening and
    /// verifying `min` connections.
    pub fn open(path: impl AsRef<Path>, min: usize, max: usize) -> Result<Self, PoolError> {
        let path = path.as_ref().to_path_buf();
        let max = max.max(1);
        let min = min.min(max);

        let mut idle = Vec::with_capacity(min);
        for _ in 0..min {
            idle.push(open_connection(&path)?);
        }

        debug!(path = %path.display(), min, max, "connection pool opened");
        Ok(Self {
            inner: Arc::new(PoolInner {
                path,
                min,
                max,
                idle: Mutex::new(idle),
                opened: AtomicUsize::new(min),
                permits: Arc::new(Semaphore::new(max)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Lease a connection, waiting up to `timeout` when all `max`
    /// connections are in use.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let permit = match tokio::time::timeout(
            timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                return Err(PoolError::Exhausted {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let existing = self.inner.idle.lock().unwrap().pop();
        let conn = match existing {
            Some(conn) => conn,
            None => {
                // Holding a permit guarantees opened < max here.
                let conn = open_connection(&self.inner.path)?;
                self.inner.opened.fetch_add(1, Ordering::AcqRel);
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            broken: false,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Close every idle connection and fail all subsequent acquires.
    /// Connections currently leased are closed when their guard drops.
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();

        let drained: Vec<Connection> = self.inner.idle.lock().unwrap().drain(..).collect();
        self.inner.opened.fetch_sub(drained.len(), Ordering::AcqRel);
        debug!(closed = drained.len(), "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().unwrap().len();
        PoolStats {
            opened: self.inner.opened.load(Ordering::Acquire),
            idle,
            in_use: self.inner.max - self.inner.permits.available_permits(),
            min: self.inner.min,
            max: self.inner.max,
        }
    }
}

/// A leased connection. Dereferences to [`rusqlite::Connection`];
/// returns itself to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    broken: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Flag this connection as unusable. It will be closed on release
    /// and, if needed to keep `min` connections alive, replaced.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.pool.closed.load(Ordering::Acquire) {
            drop(conn);
            self.pool.opened.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        if self.broken {
            drop(conn);
            let opened = self.pool.opened.fetch_sub(1, Ordering::AcqRel) - 1;
            warn!(opened, "closed broken connection");

            // Keep the pool at its configured floor.
            if opened < self.pool.min {
                match open_connection(&self.pool.path) {
                    Ok(replacement) => {
                        self.pool.idle.lock().unwrap().push(replacement);
                        self.pool.opened.fetch_add(1, Ordering::AcqRel);
                        debug!("opened replacement connection");
                    }
                    Err(e) => warn!(error = %e, "failed to replace broken connection"),
                }
            }
            return;
        }

        self.pool.idle.lock().unwrap().push(conn);
    }
}

/// Open one connection and verify it answers a trivial query. WAL keeps
/// readers unblocked while a batch worker holds the write transaction.
fn open_connection(path: &Path) -> Result<Connection, PoolError> {
    let conn = Connection::open(path).map_err(PoolError::Open)?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(PoolError::Open)?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(PoolError::Open)?;
    conn.pragma_update(None, "foreign_keys", "OFF")
        .map_err(PoolError::Open)?;
    conn.query_row("SELECT 1", [], |_| Ok(()))
        .map_err(PoolError::Open)?;
    Ok(conn)
}
