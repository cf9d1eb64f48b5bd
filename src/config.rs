//! Persisted operator preferences.
//!
//! Precedence: defaults < file < environment

use anyhow::{Context, Result};
use directories::BaseDirs;
use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const PREFERENCES_FILE: &str = ".qrsend.json";

pub fn preferences_path() -> PathBuf {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(PREFERENCES_FILE))
        .unwrap_or_else(|| PathBuf::from(PREFERENCES_FILE))
}

/// Durable operator choices; today just the preferred network interface.
/// Plain last-write-wins file, no locking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Preferences {
    pub interface: Option<String>,
    #[serde(skip, default = "preferences_path")]
    path: PathBuf,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            interface: None,
            path: preferences_path(),
        }
    }
}

impl Preferences {
    /// Preferences persisted at a custom location.
    pub fn stored_at(path: PathBuf) -> Self {
        Self {
            interface: None,
            path,
        }
    }

    /// Load from defaults, the preferences file, then `QRSEND_*` variables.
    pub fn load() -> Result<Self> {
        Self::load_from(&preferences_path())
    }

    fn load_from(path: &Path) -> Result<Self> {
        let mut preferences: Preferences = Figment::new()
            .merge(Serialized::defaults(Preferences::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed("QRSEND_"))
            .extract()
            .context("Failed to load preferences")?;
        preferences.path = path.to_path_buf();
        Ok(preferences)
    }

    /// Write the preferences file. Runs during shutdown cleanup.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize preferences")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    /// Remove the preferences file (`--force`). A missing file is fine.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to delete {}", self.path.display()))
            }
        }
    }
}
