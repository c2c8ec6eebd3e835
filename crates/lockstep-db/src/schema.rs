use chrono::{DateTime, Utc};
use lockstep_common::{Error, Result};
use rusqlite::Connection;
use tracing::debug;

/// Singleton key of the lock row.
pub(crate) const LOCK_ROW_ID: i64 = 1;

const BOOTSTRAP_SQL: &str = "
CREATE TABLE IF NOT EXISTS migrations_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    locked INTEGER NOT NULL DEFAULT 0,
    locked_at TEXT,
    locked_by TEXT
);

INSERT OR IGNORE INTO migrations_lock (id, locked, locked_at, locked_by)
    VALUES (1, 0, NULL, NULL);

CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// Create the lock and ledger tables and seed the lock row. Safe to call on
/// every run: existing tables and rows are left untouched.
pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(BOOTSTRAP_SQL)
        .map_err(|e| Error::Database(format!("schema bootstrap failed: {e}")))?;
    debug!("migration schema ready");
    Ok(())
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Accepts RFC 3339 as written by this crate and SQLite's `datetime('now')`
/// format used by the column default.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .ok()
        })
}
