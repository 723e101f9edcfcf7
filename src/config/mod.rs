//! Config loading and saving.
//!
//! The config lives at `~/.picoclaw/config.json`. Saves are transactional:
//! the current content is copied to `config.json.bak` first, then the new
//! document is written to a temp file and renamed into place, so a failed
//! write never corrupts the original.

pub mod schema;

pub use schema::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default config path (`~/.picoclaw/config.json`).
pub fn default_config_path() -> PathBuf {
    crate::util::picoclaw_home().join("config.json")
}

/// Load the config document. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config from {}", path.display()))
}

/// Save the config atomically, backing up any existing file first.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if path.exists() {
        let backup = path.with_extension("json.bak");
        std::fs::copy(path, &backup)
            .with_context(|| format!("failed to back up config to {}", backup.display()))?;
    }

    let json = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .with_context(|| format!("failed to write temp config {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move config into place at {}", path.display()))?;
    Ok(())
}
