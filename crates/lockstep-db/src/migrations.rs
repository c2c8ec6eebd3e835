//! Discovery of migration scripts on disk.
//!
//! A migration unit is a file directly inside the source directory whose
//! name ends with the forward suffix. The full file name is its version, and
//! units apply in ascending byte-wise order of that name, so `0010_b` sorts
//! after `0002_c`.

use std::fs;
use std::path::{Path, PathBuf};

use lockstep_common::{Error, Result};
use lockstep_config::model::DEFAULT_SUFFIX;
use tracing::{debug, warn};

/// One migration script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    pub version: String,
    pub path: PathBuf,
}

impl MigrationUnit {
    pub fn read_sql(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|source| Error::Source {
            path: self.path.clone(),
            source,
        })
    }
}

/// A directory of migration scripts.
#[derive(Debug, Clone)]
pub struct MigrationSource {
    dir: PathBuf,
    suffix: String,
}

impl MigrationSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            suffix: DEFAULT_SUFFIX.to_string(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Every candidate unit, sorted. Ledger filtering happens at apply time.
    pub fn list(&self) -> Result<Vec<MigrationUnit>> {
        let source_error = |source| Error::Source {
            path: self.dir.clone(),
            source,
        };

        let mut units = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(source_error)? {
            let entry = entry.map_err(source_error)?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!("skipping non UTF-8 file name {raw:?} in {}", self.dir.display());
                    continue;
                }
            };
            if !name.ends_with(&self.suffix) {
                continue;
            }

            let path = entry.path();
            if !path.is_file() {
                debug!("skipping {} (not a file)", path.display());
                continue;
            }
            units.push(MigrationUnit {
                version: name,
                path,
            });
        }

        units.sort_by(|a, b| a.version.cmp(&b.version));
        debug!(
            "found {} migration(s) in {}",
            units.len(),
            self.dir.display()
        );
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, sql: &str) {
        fs::write(dir.join(name), sql).unwrap();
    }

    fn versions(units: &[MigrationUnit]) -> Vec<&str> {
        units.iter().map(|u| u.version.as_str()).collect()
    }

    #[test]
    fn lists_units_in_lexical_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "0001_a.up.sql", "");
        touch(dir.path(), "0010_b.up.sql", "");
        touch(dir.path(), "0002_c.up.sql", "");

        let units = MigrationSource::new(dir.path()).list().unwrap();
        assert_eq!(
            versions(&units),
            ["0001_a.up.sql", "0002_c.up.sql", "0010_b.up.sql"]
        );
    }

    #[test]
    fn ordering_is_not_numeric_aware() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "9_last.up.sql", "");
        touch(dir.path(), "10_first.up.sql", "");

        let units = MigrationSource::new(dir.path()).list().unwrap();
        assert_eq!(versions(&units), ["10_first.up.sql", "9_last.up.sql"]);
    }

    #[test]
    fn filters_by_suffix_and_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "0001_a.up.sql", "");
        touch(dir.path(), "0001_a.down.sql", "");
        touch(dir.path(), "README.md", "");
        fs::create_dir(dir.path().join("0002_dir.up.sql")).unwrap();

        let units = MigrationSource::new(dir.path()).list().unwrap();
        assert_eq!(versions(&units), ["0001_a.up.sql"]);
        assert_eq!(units[0].path, dir.path().join("0001_a.up.sql"));
    }

    #[test]
    fn custom_suffix() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "0001_a.up.sql", "");
        touch(dir.path(), "0001_a.sql", "");

        let source = MigrationSource::new(dir.path()).with_suffix(".sql");
        assert_eq!(source.suffix(), ".sql");
        assert_eq!(
            versions(&source.list().unwrap()),
            ["0001_a.sql", "0001_a.up.sql"]
        );
    }

    #[test]
    fn missing_directory_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        match MigrationSource::new(&missing).list() {
            Err(Error::Source { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected source error, got {other:?}"),
        }
    }

    #[test]
    fn read_sql_returns_contents() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "0001_a.up.sql", "CREATE TABLE a (id INTEGER);");

        let units = MigrationSource::new(dir.path()).list().unwrap();
        assert_eq!(units[0].read_sql().unwrap(), "CREATE TABLE a (id INTEGER);");

        fs::remove_file(&units[0].path).unwrap();
        assert!(matches!(units[0].read_sql(), Err(Error::Source { .. })));
    }
}
