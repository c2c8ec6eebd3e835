//! Advisory migration lock stored as a singleton row in the target database.
//!
//! The row is read inside an `IMMEDIATE` transaction, which takes SQLite's
//! write lock before the read. Two callers racing to acquire therefore see
//! each other's decision, the same guarantee `SELECT ... FOR UPDATE` gives on
//! server databases.

use std::ops::{Deref, DerefMut};
use std::sync::MutexGuard;

use chrono::{DateTime, Utc};
use lockstep_common::{Error, LockError, Result, ServiceId};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::schema::{LOCK_ROW_ID, now_rfc3339, parse_timestamp};

/// The identity and time recorded on a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Locked(LockHolder),
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Locked(_))
    }

    pub fn holder(&self) -> Option<&LockHolder> {
        match self {
            LockState::Locked(holder) => Some(holder),
            LockState::Unlocked => None,
        }
    }
}

/// Take the migration lock for `holder`.
///
/// Fails fast with [`LockError::AlreadyLocked`] when any identity, including
/// `holder` itself, already holds it. Never waits for the holder to finish.
pub fn acquire(conn: &mut Connection, holder: &ServiceId) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| Error::Database(format!("failed to begin lock transaction: {e}")))?;

    let row: Option<(bool, Option<String>)> = tx
        .query_row(
            "SELECT locked, locked_by FROM migrations_lock WHERE id = ?1",
            params![LOCK_ROW_ID],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read lock row: {e}")))?;

    match row {
        Some((true, held_by)) => {
            warn!(
                "{holder} cannot take the migration lock: held by {}",
                held_by.as_deref().unwrap_or("unknown holder")
            );
            // dropping `tx` rolls back
            return Err(LockError::AlreadyLocked { held_by }.into());
        }
        Some((false, _)) => {
            tx.execute(
                "UPDATE migrations_lock SET locked = 1, locked_at = ?2, locked_by = ?3 WHERE id = ?1",
                params![LOCK_ROW_ID, now_rfc3339(), holder.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to set lock: {e}")))?;
        }
        None => {
            tx.execute(
                "INSERT INTO migrations_lock (id, locked, locked_at, locked_by) VALUES (?1, 1, ?2, ?3)",
                params![LOCK_ROW_ID, now_rfc3339(), holder.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to create lock row: {e}")))?;
        }
    }

    tx.commit()
        .map_err(|e| Error::Database(format!("failed to commit lock: {e}")))?;
    info!("migration lock acquired by {holder}");
    Ok(())
}

/// Release the lock if `holder` owns it.
///
/// Releasing a free lock is a no-op. Releasing a lock recorded for another
/// identity fails with [`LockError::NotHolder`] and leaves the row untouched;
/// use [`force_unlock`] to clear a lock regardless of its holder.
pub fn release(conn: &Connection, holder: &ServiceId) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE migrations_lock SET locked = 0, locked_at = NULL, locked_by = NULL
             WHERE id = ?1 AND locked = 1 AND locked_by = ?2",
            params![LOCK_ROW_ID, holder.as_str()],
        )
        .map_err(|e| Error::Database(format!("failed to release lock: {e}")))?;

    if changed == 1 {
        info!("migration lock released by {holder}");
        return Ok(());
    }

    match lock_state(conn)? {
        LockState::Unlocked => {
            warn!("{holder} released the migration lock but it was not held");
            Ok(())
        }
        LockState::Locked(other) => Err(LockError::NotHolder { held_by: other.id }.into()),
    }
}

/// Clear the lock whoever holds it and return the previous holder.
///
/// This is the operator recovery path for a holder that crashed without
/// releasing. Nothing expires a lock on its own.
pub fn force_unlock(conn: &mut Connection) -> Result<Option<LockHolder>> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| Error::Database(format!("failed to begin unlock transaction: {e}")))?;

    let previous = lock_state(&tx)?;
    tx.execute(
        "UPDATE migrations_lock SET locked = 0, locked_at = NULL, locked_by = NULL WHERE id = ?1",
        params![LOCK_ROW_ID],
    )
    .map_err(|e| Error::Database(format!("failed to clear lock: {e}")))?;
    tx.commit()
        .map_err(|e| Error::Database(format!("failed to commit unlock: {e}")))?;

    match previous {
        LockState::Locked(holder) => {
            warn!(
                "migration lock forcibly cleared (was held by {})",
                holder.id.as_deref().unwrap_or("unknown holder")
            );
            Ok(Some(holder))
        }
        LockState::Unlocked => Ok(None),
    }
}

/// Current lock row. A missing row reads as unlocked.
pub fn lock_state(conn: &Connection) -> Result<LockState> {
    let row: Option<(bool, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT locked, locked_by, locked_at FROM migrations_lock WHERE id = ?1",
            params![LOCK_ROW_ID],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read lock row: {e}")))?;

    Ok(match row {
        Some((true, id, locked_at)) => LockState::Locked(LockHolder {
            id,
            locked_at: locked_at.as_deref().and_then(parse_timestamp),
        }),
        _ => LockState::Unlocked,
    })
}

/// Roll back a transaction left open on `conn`, typically by a migration
/// script that ran `BEGIN` and failed before its `COMMIT`. Anything written on
/// the connection afterwards would otherwise vanish with that transaction.
pub(crate) fn rollback_open_transaction(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    warn!("rolling back transaction left open on the migration connection");
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        error!("failed to roll back open transaction: {e}");
    }
}

/// A held migration lock. Owns the connection for as long as the lock is
/// held and releases it when dropped, including during unwinding.
pub struct LockGuard<'a> {
    conn: MutexGuard<'a, Connection>,
    holder: ServiceId,
    armed: bool,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(mut conn: MutexGuard<'a, Connection>, holder: &ServiceId) -> Result<Self> {
        acquire(&mut conn, holder)?;
        Ok(Self {
            conn,
            holder: holder.clone(),
            armed: true,
        })
    }

    pub fn holder(&self) -> &ServiceId {
        &self.holder
    }

    /// Release now and report the outcome instead of logging it on drop.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        rollback_open_transaction(&self.conn);
        release(&self.conn, &self.holder)
    }
}

impl Deref for LockGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for LockGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        rollback_open_transaction(&self.conn);
        if let Err(e) = release(&self.conn, &self.holder) {
            error!("failed to release migration lock held by {}: {e}", self.holder);
        }
    }
}
