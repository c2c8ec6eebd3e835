use chrono::{DateTime, Utc};
use lockstep_common::{Error, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::schema::{now_rfc3339, parse_timestamp};

/// A row of the append-only `migrations` ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: String,
    pub applied_at: DateTime<Utc>,
}

/// Whether `version` has a ledger row. Read errors are returned, never
/// treated as "not applied".
pub fn is_applied(conn: &Connection, version: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE version = ?1)",
        params![version],
        |row| row.get(0),
    )
    .map_err(|e| Error::Database(format!("failed to check migration {version}: {e}")))
}

/// Append the ledger row for `version`. A second insert of the same version
/// fails on the unique constraint.
pub fn record(conn: &Connection, version: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO migrations (version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()],
    )
    .map_err(|e| Error::Database(format!("failed to record migration {version}: {e}")))?;
    Ok(())
}

/// All ledger rows in version order.
pub fn applied(conn: &Connection) -> Result<Vec<AppliedMigration>> {
    let mut stmt = conn
        .prepare("SELECT version, applied_at FROM migrations ORDER BY version ASC")
        .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

    let rows = stmt
        .query_map([], |row| {
            let raw: String = row.get(1)?;
            let applied_at = parse_timestamp(&raw).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    Type::Text,
                    format!("invalid applied_at timestamp: {raw}").into(),
                )
            })?;
            Ok(AppliedMigration {
                version: row.get(0)?,
                applied_at,
            })
        })
        .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))
}
