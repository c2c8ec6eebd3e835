use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SUFFIX: &str = ".up.sql";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level Lockstep configuration. Every field has a default, so an empty
/// file (or no file at all) is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    /// Lock holder label. A per-process identity is generated when unset.
    pub identity: Option<String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// How long a connection waits for SQLite's write lock before failing.
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lockstep.db"),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub dir: PathBuf,
    pub suffix: String,
    /// Run each script and its ledger insert in a single transaction.
    pub transactional: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
            suffix: DEFAULT_SUFFIX.to_string(),
            transactional: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.database.path, PathBuf::from("lockstep.db"));
        assert_eq!(config.database.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.migrations.dir, PathBuf::from("migrations"));
        assert_eq!(config.migrations.suffix, ".up.sql");
        assert!(config.migrations.transactional);
        assert!(config.identity.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_fields() {
        let config: AppConfig = serde_yaml::from_str(
            "migrations:\n  dir: db/migrations\nidentity: svc-A\n",
        )
        .unwrap();
        assert_eq!(config.migrations.dir, PathBuf::from("db/migrations"));
        assert_eq!(config.migrations.suffix, ".up.sql");
        assert_eq!(config.identity.as_deref(), Some("svc-A"));
        assert_eq!(config.database, DatabaseConfig::default());
    }
}
