//! SQLite persistence layer.
//!
//! Each instance owns one database file derived from its listen port, so
//! instances never contend on storage. Plain reads run on any pooled
//! connection; reservation execution uses `BEGIN IMMEDIATE` so writers
//! serialize while WAL keeps readers unblocked.

pub mod pool;

pub use pool::{ConnectionPool, PoolError, PoolStats, PooledConnection};

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::info;

use crate::model::{Book, NewBook, NewUser, Reservation, ReservationStatus, User};

/// Database-layer error surface.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("failed to open connection: {0}")]
    Open(String),

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<PoolError> for DbError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } => DbError::PoolExhausted,
            PoolError::Closed => DbError::PoolClosed,
            PoolError::Open(e) => DbError::Open(e.to_string()),
        }
    }
}

impl DbError {
    /// Worth retrying on a later batch tick: lock contention and pool
    /// pressure clear on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::PoolExhausted => true,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Unique-key collision, surfaced to clients as 409.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
        )
    }

    /// The connection itself is suspect and must not be reused.
    pub fn is_io_level(&self) -> bool {
        matches!(
            self,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) if matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::DiskFull
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
            )
        )
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS books (
    isbn TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    author TEXT NOT NULL,
    category TEXT NOT NULL,
    total_copies INTEGER NOT NULL,
    available_copies INTEGER NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    membership_type TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS reservations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    isbn TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    processed_at DATETIME NULL,
    reason TEXT NULL,
    FOREIGN KEY (user_id) REFERENCES users (user_id),
    FOREIGN KEY (isbn) REFERENCES books (isbn)
);

CREATE INDEX IF NOT EXISTS idx_books_category ON books(category);
CREATE INDEX IF NOT EXISTS idx_reservations_user ON reservations(user_id);
CREATE INDEX IF NOT EXISTS idx_reservations_status ON reservations(status);
"#;

/// Database file for the instance listening on `port`.
pub fn database_path(data_dir: &str, port: u16) -> PathBuf {
    Path::new(data_dir).join(format!("library_system_{port}.db"))
}

/// Create the schema and seed the starter catalog when empty. Runs on a
/// direct connection before the pool opens.
pub fn initialize(path: &Path) -> Result<(), DbError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "OFF")?;
    conn.execute_batch(SCHEMA)?;
    seed_if_empty(&conn)?;
    Ok(())
}

/// Insert the sample catalog and users on first boot with an empty
/// books table. Returns whether anything was inserted.
pub fn seed_if_empty(conn: &Connection) -> Result<bool, DbError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(false);
    }

    let books = [
        ("978-0134685991", "Effective Java", "Joshua Bloch", "Programming", 5),
        ("978-0135957059", "The Pragmatic Programmer", "David Thomas", "Programming", 3),
        ("978-0596517748", "JavaScript: The Good Parts", "Douglas Crockford", "Programming", 4),
        ("978-0321125215", "Domain-Driven Design", "Eric Evans", "Software Architecture", 2),
        ("978-0134494166", "Clean Architecture", "Robert Martin", "Software Architecture", 3),
        ("978-1449373320", "Designing Data-Intensive Applications", "Martin Kleppmann", "Systems", 2),
        ("978-0201633610", "Design Patterns", "Gang of Four", "Programming", 4),
        ("978-0132350884", "Clean Code", "Robert Martin", "Programming", 5),
    ];
    for (isbn, title, author, category, copies) in books {
        conn.execute(
            "INSERT INTO books (isbn, title, author, category, total_copies, available_copies)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![isbn, title, author, category, copies],
        )?;
    }

    let users = [
        ("USR001", "Alice Johnson", "alice@university.edu", "student"),
        ("USR002", "Bob Smith", "bob@university.edu", "faculty"),
        ("USR003", "Carol Davis", "carol@library.org", "staff"),
        ("USR004", "David Wilson", "david@university.edu", "student"),
        ("USR005", "Eva Brown", "eva@university.edu", "faculty"),
    ];
    for (user_id, name, email, membership) in users {
        conn.execute(
            "INSERT INTO users (user_id, name, email, membership_type)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, name, email, membership],
        )?;
    }

    info!(books = books.len(), users = users.len(), "seeded sample data");
    Ok(true)
}

fn book_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        isbn: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        category: row.get(3)?,
        total_copies: row.get(4)?,
        available_copies: row.get(5)?,
    })
}

const BOOK_COLUMNS: &str = "isbn, title, author, category, total_copies, available_copies";

pub fn list_books(conn: &Connection, category: Option<&str>) -> Result<Vec<Book>, DbError> {
    let mut books = Vec::new();
    match category {
        Some(category) => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {BOOK_COLUMNS} FROM books WHERE category = ?1 ORDER BY title"
            ))?;
            let rows = stmt.query_map([category], book_from_row)?;
            for row in rows {
                books.push(row?);
            }
        }
        None => {
            let mut stmt = conn
                .prepare_cached(&format!("SELECT {BOOK_COLUMNS} FROM books ORDER BY title"))?;
            let rows = stmt.query_map([], book_from_row)?;
            for row in rows {
                books.push(row?);
            }
        }
    }
    Ok(books)
}

pub fn get_book(conn: &Connection, isbn: &str) -> Result<Option<Book>, DbError> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {BOOK_COLUMNS} FROM books WHERE isbn = ?1"))?;
    Ok(stmt.query_row([isbn], book_from_row).optional()?)
}

pub fn book_exists(conn: &Connection, isbn: &str) -> Result<bool, DbError> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM books WHERE isbn = ?1")?;
    Ok(stmt.query_row([isbn], |_| Ok(())).optional()?.is_some())
}

/// Insert a new book, fully available. Duplicate ISBNs surface as a
/// constraint violation.
pub fn insert_book(conn: &Connection, book: &NewBook) -> Result<Book, DbError> {
    conn.execute(
        "INSERT INTO books (isbn, title, author, category, total_copies, available_copies)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![book.isbn, book.title, book.author, book.category, book.total_copies],
    )?;
    Ok(Book {
        isbn: book.isbn.clone(),
        title: book.title.clone(),
        author: book.author.clone(),
        category: book.category.clone(),
        total_copies: book.total_copies,
        available_copies: book.total_copies,
    })
}

pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<User>, DbError> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, name, email, membership_type FROM users WHERE user_id = ?1",
    )?;
    let row = stmt
        .query_row([user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .optional()?;

    Ok(row.and_then(|(user_id, name, email, membership)| {
        crate::model::MembershipType::parse(&membership).map(|membership_type| User {
            user_id,
            name,
            email,
            membership_type,
        })
    }))
}

pub fn user_exists(conn: &Connection, user_id: &str) -> Result<bool, DbError> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM users WHERE user_id = ?1")?;
    Ok(stmt.query_row([user_id], |_| Ok(())).optional()?.is_some())
}

pub fn insert_user(conn: &Connection, user: &NewUser) -> Result<User, DbError> {
    conn.execute(
        "INSERT INTO users (user_id, name, email, membership_type) VALUES (?1, ?2, ?3, ?4)",
        params![
            user.user_id,
            user.name,
            user.email,
            user.membership_type.as_str()
        ],
    )?;
    Ok(User {
        user_id: user.user_id.clone(),
        name: user.name.clone(),
        email: user.email.clone(),
        membership_type: user.membership_type,
    })
}

/// Insert a pending reservation row and return its id. AUTOINCREMENT
/// keeps ids unique and strictly increasing within the instance.
pub fn insert_pending_reservation(
    conn: &Connection,
    user_id: &str,
    isbn: &str,
) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO reservations (user_id, isbn, status) VALUES (?1, ?2, 'pending')",
        params![user_id, isbn],
    )?;
    Ok(conn.last_insert_rowid())
}

fn reservation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reservation> {
    let status: String = row.get(3)?;
    Ok(Reservation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        isbn: row.get(2)?,
        status: ReservationStatus::parse(&status).unwrap_or(ReservationStatus::Pending),
        created_at: row.get(4)?,
        processed_at: row.get(5)?,
        reason: row.get(6)?,
    })
}

const RESERVATION_COLUMNS: &str = "id, user_id, isbn, status, created_at, processed_at, reason";

pub fn reservations_for_user(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<Reservation>, DbError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE user_id = ?1 ORDER BY created_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map([user_id], reservation_from_row)?;
    let mut reservations = Vec::new();
    for row in rows {
        reservations.push(row?);
    }
    Ok(reservations)
}

pub fn get_reservation(conn: &Connection, id: i64) -> Result<Option<Reservation>, DbError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = ?1"
    ))?;
    Ok(stmt.query_row([id], reservation_from_row).optional()?)
}

/// Mark a reservation terminally rejected outside the batch path (queue
/// overflow, retries exhausted, unknown references).
pub fn mark_rejected(conn: &Connection, id: i64, reason: &str) -> Result<(), DbError> {
    conn.execute(
        "UPDATE reservations
         SET status = 'rejected', reason = ?2, processed_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND status = 'pending'",
        params![id, reason],
    )?;
    Ok(())
}

/// Terminal result of executing one queued reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Confirmed,
    Rejected(String),
}

/// Execute one reservation under an exclusive write transaction.
///
/// The book row is re-read inside the transaction (the cache is never
/// authoritative); a copy is claimed and the reservation confirmed in
/// the same commit, so availability can never go negative and the same
/// copy is never granted twice.
pub fn execute_reservation(
    conn: &mut Connection,
    reservation_id: i64,
    isbn: &str,
) -> Result<ExecutionOutcome, DbError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let available: Option<u32> = tx
        .query_row(
            "SELECT available_copies FROM books WHERE isbn = ?1",
            [isbn],
            |row| row.get(0),
        )
        .optional()?;

    let outcome = match available {
        None => {
            tx.execute(
                "UPDATE reservations
                 SET status = 'rejected', reason = 'unknown isbn', processed_at = CURRENT_TIMESTAMP
                 WHERE id = ?1",
                [reservation_id],
            )?;
            ExecutionOutcome::Rejected("unknown isbn".to_string())
        }
        Some(n) if n >= 1 => {
            tx.execute(
                "UPDATE books SET available_copies = available_copies - 1 WHERE isbn = ?1",
                [isbn],
            )?;
            tx.execute(
                "UPDATE reservations
                 SET status = 'confirmed', processed_at = CURRENT_TIMESTAMP
                 WHERE id = ?1",
                [reservation_id],
            )?;
            ExecutionOutcome::Confirmed
        }
        Some(_) => {
            tx.execute(
                "UPDATE reservations
                 SET status = 'rejected', reason = 'no copies available', processed_at = CURRENT_TIMESTAMP
                 WHERE id = ?1",
                [reservation_id],
            )?;
            ExecutionOutcome::Rejected("no copies available".to_string())
        }
    };

    tx.commit()?;
    Ok(outcome)
}

/// Run `f` on a pooled connection inside a blocking task.
///
/// The lease moves into the closure, so it is released on every exit
/// path, including panics. A closure failing with an I/O-level error
/// marks the connection broken before release.
pub async fn with_conn<T, F>(
    pool: &ConnectionPool,
    timeout: Duration,
    f: F,
) -> Result<T, DbError>
where
    F: FnOnce(&mut PooledConnection) -> Result<T, DbError> + Send + 'static,
    T: Send + 'static,
{
    let mut lease = pool.acquire(timeout).await?;
    tokio::task::spawn_blocking(move || {
        let result = f(&mut lease);
        if let Err(err) = &result {
            if err.is_io_level() {
                lease.mark_broken();
            }
        }
        result
    })
    .await
    .map_err(|e| DbError::Join(e.to_string()))?
}
