//! Shared WAL-mode SQLite handle and schema bootstrap.
//!
//! Grounded on `signals/db_storage.rs`'s `DbSignalStorage::new` (WAL pragma block,
//! `execute_batch` schema load, `Arc<Mutex<Connection>>` sharing) generalized from a
//! signals-only store to the full set of tables this crate keeps in one file: the reliable
//! queue, signals, trades and the runtime-config key/value table.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA mmap_size = 268435456;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS queue_pending (
    thread_id TEXT PRIMARY KEY,
    thread_name TEXT,
    payload_json TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_processing (
    thread_id TEXT PRIMARY KEY,
    thread_name TEXT,
    payload_json TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    claimed_at INTEGER NOT NULL,
    seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_completed (
    thread_id TEXT PRIMARY KEY,
    completed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_failed (
    thread_id TEXT PRIMARY KEY,
    error_kind TEXT NOT NULL,
    error_message TEXT NOT NULL,
    failed_at INTEGER NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_dead_letter (
    thread_id TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    raw_payload TEXT NOT NULL,
    dead_lettered_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_scheduled (
    thread_id TEXT PRIMARY KEY,
    thread_name TEXT,
    due_at INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    scheduled_context_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_scheduled_due ON queue_scheduled(due_at, seq);

CREATE TABLE IF NOT EXISTS signals (
    thread_id TEXT PRIMARY KEY,
    decision_json TEXT,
    last_decided_at INTEGER,
    signal_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    parent_order_id TEXT NOT NULL,
    occ_symbol TEXT NOT NULL,
    contract_id TEXT,
    side TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    entry_price TEXT NOT NULL,
    take_profit TEXT NOT NULL,
    stop_loss TEXT NOT NULL,
    model_id TEXT NOT NULL,
    confidence REAL,
    status TEXT NOT NULL,
    simulated INTEGER NOT NULL,
    entry_time INTEGER NOT NULL,
    exit_time INTEGER,
    exit_price TEXT,
    pnl TEXT
);
CREATE INDEX IF NOT EXISTS idx_trades_thread ON trades(thread_id);
CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);

CREATE TABLE IF NOT EXISTS runtime_config (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS prompt_templates (
    kind TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS seq_counter (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    next_seq INTEGER NOT NULL
);
INSERT OR IGNORE INTO seq_counter (id, next_seq) VALUES (1, 1);
"#;

/// A shared, lock-guarded connection to the one SQLite file backing the queue, the signal/trade
/// stores and the runtime-config table. `rusqlite::Connection` isn't `Sync`; `parking_lot::Mutex`
/// is the cheap way to make it shareable across the worker pool the way the teacher does.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {db_path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!(%journal_mode, "WAL mode not active");
        }

        info!(path = %db_path, "database initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests. Each call gets its own isolated connection.
    #[cfg(any(test, feature = "test-util"))]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize in-memory schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Exposes the guarded connection for callers that need direct `rusqlite` access
    /// (queue, persistence, config). Keeping this crate-visible instead of fully private
    /// keeps each store's SQL next to the logic it serves, matching `db_storage.rs`'s shape
    /// where storage methods sit directly on the struct that owns the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        f(&guard)
    }

    /// Next monotonic sequence number, used to break due_at/enqueued_at ties in FIFO order.
    pub(crate) fn next_seq(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "UPDATE seq_counter SET next_seq = next_seq + 1 WHERE id = 1 RETURNING next_seq - 1",
                [],
                |row| row.get(0),
            )
            .context("failed to allocate sequence number")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_creates_schema() {
        let db = Db::open_in_memory().expect("open");
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM queue_pending", [], |r| r.get(0))?)
            })
            .expect("query");
        assert_eq!(count, 0);
    }

    #[test]
    fn next_seq_is_monotonic() {
        let db = Db::open_in_memory().expect("open");
        let a = db.next_seq().expect("seq a");
        let b = db.next_seq().expect("seq b");
        assert_eq!(b, a + 1);
    }
}
