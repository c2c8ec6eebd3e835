use std::path::Path;

use anyhow::{Context, Result, bail};
use lockstep_config::AppConfig;
use tracing::info;

pub const CONFIG_FILE: &str = "lockstep.yml";

/// Write `config` as YAML so later runs pick it up without flags. Never
/// overwrites an existing file.
pub fn write_config(config: &AppConfig, path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists, not overwriting", path.display());
    }

    let yaml = serde_yaml::to_string(config).context("failed to serialize config")?;
    std::fs::write(path, &yaml).context(format!("failed to write {}", path.display()))?;

    info!("config written to {}", path.display());
    println!("config written to {}", path.display());
    Ok(())
}
