//! CLI configuration.
//!
//! Read from `<config dir>/blockship/config.json`. Missing or unparsable
//! files fall back to defaults.

use std::path::{Path, PathBuf};

use blockship_ledger::TransferConfig;
use serde::{Deserialize, Serialize};

/// Environment variable naming the session root.
pub const HOME_ENV: &str = "BLOCKSHIP_HOME";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Session root; `sessions/` lives under it.
    pub root: Option<PathBuf>,
    /// Defaults for new sessions.
    pub transfer: TransferConfig,
}

impl CliConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// `--root` flag, then the config file, then `BLOCKSHIP_HOME`, then
    /// `<config dir>/blockship`.
    pub fn session_root(&self, flag: Option<&Path>) -> anyhow::Result<PathBuf> {
        if let Some(root) = flag {
            return Ok(root.to_path_buf());
        }
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(home));
        }
        Ok(config_base_dir()?.join("blockship"))
    }
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("blockship").join("config.json"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(xdg));
        }
        let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
        Ok(PathBuf::from(home).join(".config"))
    }
}
