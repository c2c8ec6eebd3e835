use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to apply migration {version}: {reason}")]
    Apply { version: String, reason: String },

    #[error("migration source error at {}: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when another identity holds the migration lock.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Error::Lock(LockError::AlreadyLocked { .. }))
    }
}

/// Failures of the migration lock protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error(
        "migrations are already in progress (lock held by {})",
        .held_by.as_deref().unwrap_or("unknown holder")
    )]
    AlreadyLocked { held_by: Option<String> },

    #[error(
        "migration lock is held by {}, not by the releasing identity",
        .held_by.as_deref().unwrap_or("unknown holder")
    )]
    NotHolder { held_by: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::{Error, LockError};

    #[test]
    fn error_display_includes_context() {
        let e = Error::Config("bad yaml".into());
        assert_eq!(e.to_string(), "configuration error: bad yaml");

        let e = Error::Database("disk I/O error".into());
        assert_eq!(e.to_string(), "database error: disk I/O error");

        let e = Error::Apply {
            version: "0002_users.up.sql".into(),
            reason: "no such table: accounts".into(),
        };
        assert_eq!(
            e.to_string(),
            "failed to apply migration 0002_users.up.sql: no such table: accounts"
        );

        let e = Error::Other("misc".into());
        assert_eq!(e.to_string(), "misc");
    }

    #[test]
    fn lock_errors_name_the_holder() {
        let e: Error = LockError::AlreadyLocked {
            held_by: Some("svc-A".into()),
        }
        .into();
        assert_eq!(
            e.to_string(),
            "migrations are already in progress (lock held by svc-A)"
        );
        assert!(e.is_lock_contention());

        let e = LockError::NotHolder { held_by: None };
        assert_eq!(
            e.to_string(),
            "migration lock is held by unknown holder, not by the releasing identity"
        );
        assert!(!Error::Lock(e).is_lock_contention());
    }

    #[test]
    fn source_error_mentions_path() {
        let e = Error::Source {
            path: "/srv/migrations".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(
            e.to_string(),
            "migration source error at /srv/migrations: missing"
        );
    }
}
