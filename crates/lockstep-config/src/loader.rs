use std::path::{Path, PathBuf};

use lockstep_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

/// File names probed in the working directory, in order.
const LOCAL_CANDIDATES: &[&str] = &["lockstep.yml", "lockstep.yaml", "lockstep.toml"];

/// Loads `AppConfig` from YAML or TOML files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a config file, choosing the parser from the file extension.
    pub fn load(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => parse_yaml(&contents)?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Find the first config file in the usual places, or fall back to defaults.
    pub fn discover() -> Result<AppConfig> {
        match Self::candidates().into_iter().find(|p| p.is_file()) {
            Some(path) => Self::load(&path),
            None => {
                debug!("no config file found, using defaults");
                Ok(AppConfig::default())
            }
        }
    }

    /// Search order used by [`ConfigLoader::discover`].
    pub fn candidates() -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = LOCAL_CANDIDATES.iter().map(PathBuf::from).collect();
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("lockstep").join("config.yml"));
        }
        paths
    }
}

// serde_yaml rejects an empty document; treat it as "all defaults".
fn parse_yaml(contents: &str) -> Result<AppConfig> {
    if contents.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(contents).map_err(|e| Error::Config(format!("YAML parse error: {e}")))
}
