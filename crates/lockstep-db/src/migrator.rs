use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lockstep_common::{Error, Result, ServiceId};
use lockstep_config::AppConfig;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::ledger::{self, AppliedMigration};
use crate::lock::{self, LockGuard, LockHolder, LockState};
use crate::migrations::{MigrationSource, MigrationUnit};
use crate::schema;

/// Applies migration scripts exactly once, in order, under the database lock.
pub struct Migrator {
    conn: Mutex<Connection>,
    identity: ServiceId,
    source: MigrationSource,
    transactional: bool,
}

/// Outcome of a successful [`Migrator::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub lock: LockState,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<String>,
}

impl Migrator {
    /// Wrap a live connection. Scripts are read from `dir`.
    pub fn new(conn: Connection, identity: ServiceId, dir: impl Into<PathBuf>) -> Self {
        Self {
            conn: Mutex::new(conn),
            identity,
            source: MigrationSource::new(dir),
            transactional: true,
        }
    }

    /// Open `db_path` with [`open_connection`]. `busy_timeout` bounds how long
    /// a racing acquire waits for SQLite's write lock before failing.
    pub fn open(
        db_path: &Path,
        busy_timeout: Duration,
        identity: ServiceId,
        dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let conn = open_connection(db_path, busy_timeout)?;
        Ok(Self::new(conn, identity, dir))
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let conn = open_connection(&config.database.path, config.database.busy_timeout())?;
        let identity = config
            .identity
            .as_deref()
            .map(ServiceId::from_string)
            .unwrap_or_default();

        Ok(Self::new(conn, identity, &config.migrations.dir)
            .with_suffix(&config.migrations.suffix)
            .transactional(config.migrations.transactional))
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.source = self.source.with_suffix(suffix);
        self
    }

    /// When enabled (the default) each script and its ledger row commit
    /// together. Disable for scripts that issue their own `BEGIN`/`COMMIT`;
    /// a crash between the two steps then leaves a unit applied but unrecorded.
    pub fn transactional(mut self, enabled: bool) -> Self {
        self.transactional = enabled;
        self
    }

    pub fn identity(&self) -> &ServiceId {
        &self.identity
    }

    pub fn source(&self) -> &MigrationSource {
        &self.source
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("migrator connection lock poisoned".into()))
    }

    pub fn bootstrap(&self) -> Result<()> {
        let conn = self.connection()?;
        schema::bootstrap(&conn)
    }

    /// Take the migration lock for this migrator's identity. The lock is
    /// released when the returned guard is dropped.
    pub fn acquire(&self) -> Result<LockGuard<'_>> {
        let conn = self.connection()?;
        schema::bootstrap(&conn)?;
        LockGuard::acquire(conn, &self.identity)
    }

    /// Release a lock this identity holds, for instance one left behind by a
    /// previous process that reused the identity.
    pub fn release(&self) -> Result<()> {
        let conn = self.connection()?;
        lock::release(&conn, &self.identity)
    }

    pub fn force_unlock(&self) -> Result<Option<LockHolder>> {
        let mut conn = self.connection()?;
        schema::bootstrap(&conn)?;
        lock::force_unlock(&mut conn)
    }

    pub fn lock_state(&self) -> Result<LockState> {
        let conn = self.connection()?;
        lock::lock_state(&conn)
    }

    pub fn list_units(&self) -> Result<Vec<MigrationUnit>> {
        self.source.list()
    }

    pub fn is_applied(&self, version: &str) -> Result<bool> {
        let conn = self.connection()?;
        ledger::is_applied(&conn, version)
    }

    pub fn applied(&self) -> Result<Vec<AppliedMigration>> {
        let conn = self.connection()?;
        ledger::applied(&conn)
    }

    pub fn status(&self) -> Result<MigrationStatus> {
        let conn = self.connection()?;
        schema::bootstrap(&conn)?;

        let mut pending = Vec::new();
        for unit in self.source.list()? {
            if !ledger::is_applied(&conn, &unit.version)? {
                pending.push(unit.version);
            }
        }

        Ok(MigrationStatus {
            lock: lock::lock_state(&conn)?,
            applied: ledger::applied(&conn)?,
            pending,
        })
    }

    /// Apply every pending unit under the lock.
    ///
    /// Stops at the first failing unit; units before it stay recorded and the
    /// rest are left for the next run. The lock is released on every path
    /// once it has been acquired.
    pub fn run(&self) -> Result<RunReport> {
        let conn = self.connection()?;
        schema::bootstrap(&conn)?;
        let mut guard = LockGuard::acquire(conn, &self.identity)?;

        match self.apply_pending(&mut guard) {
            Ok(report) => {
                guard.release()?;
                info!(
                    "migrations complete: {} applied, {} already applied",
                    report.applied.len(),
                    report.skipped.len()
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(release_err) = guard.release() {
                    error!("failed to release migration lock after failed run: {release_err}");
                }
                Err(e)
            }
        }
    }

    fn apply_pending(&self, conn: &mut Connection) -> Result<RunReport> {
        let mut report = RunReport::default();
        for unit in self.source.list()? {
            if ledger::is_applied(conn, &unit.version)? {
                debug!("skipping applied migration {}", unit.version);
                report.skipped.push(unit.version);
                continue;
            }

            info!("applying migration: {}", unit.version);
            self.apply_one(conn, &unit)?;
            report.applied.push(unit.version);
        }
        Ok(report)
    }

    fn apply_one(&self, conn: &mut Connection, unit: &MigrationUnit) -> Result<()> {
        let sql = unit.read_sql()?;
        let failed = |e: rusqlite::Error| Error::Apply {
            version: unit.version.clone(),
            reason: e.to_string(),
        };

        if self.transactional {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| {
                    Error::Database(format!("failed to begin migration transaction: {e}"))
                })?;
            tx.execute_batch(&sql).map_err(failed)?;
            ledger::record(&tx, &unit.version)?;
            tx.commit().map_err(|e| {
                Error::Database(format!("failed to commit migration {}: {e}", unit.version))
            })?;
        } else {
            if let Err(e) = conn.execute_batch(&sql) {
                // a script that opened its own transaction and then failed
                // leaves it open; release and the ledger must not run inside it
                lock::rollback_open_transaction(conn);
                return Err(failed(e));
            }
            ledger::record(conn, &unit.version).inspect_err(|_| {
                warn!(
                    "migration {} ran but was not recorded; resolve before the next run",
                    unit.version
                );
            })?;
        }
        Ok(())
    }
}

/// Open a database file with the pragmas every migrator connection uses.
pub fn open_connection(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    info!("opening migration database at {}", db_path.display());
    let conn = Connection::open(db_path)
        .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

    conn.busy_timeout(busy_timeout)
        .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

    Ok(conn)
}
