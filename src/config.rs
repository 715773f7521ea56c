use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Result, StorageError};

/// Store configuration, loadable from a TOML file.
///
/// Every field has a default so an empty file (or no file) yields a
/// working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path; `None` selects the default location
    pub database: Option<String>,
    /// WAL checkpoint threshold in pages
    #[serde(default = "default_wal_autocheckpoint")]
    pub wal_autocheckpoint: u32,
    /// Overwrite deleted content with zeroes (messaging data is sensitive)
    #[serde(default = "default_secure_delete")]
    pub secure_delete: bool,
}

fn default_wal_autocheckpoint() -> u32 {
    1000
}

fn default_secure_delete() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: None,
            wal_autocheckpoint: default_wal_autocheckpoint(),
            secure_delete: default_secure_delete(),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("twinstore.toml")
}

pub fn default_database_path_in(base: &Path) -> PathBuf {
    base.join(".twinstore").join("twinstore.db")
}

pub fn load_config(path: Option<&Path>) -> Result<Option<StoreConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: StoreConfig =
        toml::from_str(&contents).map_err(|e| StorageError::Config(e.to_string()))?;
    Ok(Some(config))
}

pub fn ensure_db_dir(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
