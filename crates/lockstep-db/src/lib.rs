pub mod ledger;
pub mod lock;
pub mod migrations;
pub mod migrator;
pub mod schema;

pub use ledger::AppliedMigration;
pub use lock::{LockGuard, LockHolder, LockState};
pub use migrations::{MigrationSource, MigrationUnit};
pub use migrator::{MigrationStatus, Migrator, RunReport};
