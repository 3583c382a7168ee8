//! Configuration module for localmind
//!
//! Loads config from `$XDG_CONFIG_HOME/localmind/config.toml` or `~/.config/localmind/config.toml`.
//! Falls back to embedded defaults if the file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! # Example
//!
//! ```no_run
//! use localmind::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Models live in {}", config.models_dir().unwrap().display());
//! println!("Flush interval: {} ms", config.generation.flush_interval_ms);
//! ```

pub mod schema;

pub use schema::Config;

use crate::error::{LocalmindError, Result};
use std::fs;
use std::path::{Path, PathBuf};

impl Config {
    /// Load config from the default location, or defaults if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load config from an explicit path, or defaults if absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            LocalmindError::Config(format!("Failed to parse {}: {e}", path.display()))
        })
    }

    /// Save config atomically (tmp + rename)
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| LocalmindError::Config(format!("Failed to serialize config: {e}")))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, toml_str)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    /// Resolved storage root for installed models
    pub fn models_dir(&self) -> Result<PathBuf> {
        match &self.storage.models_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_models_dir(),
        }
    }
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config)
    } else {
        dirs::config_dir()
            .ok_or_else(|| LocalmindError::Config("Cannot determine config directory".to_string()))?
    };

    Ok(config_dir.join("localmind").join("config.toml"))
}

/// Get models data directory
pub fn default_models_dir() -> Result<PathBuf> {
    let data_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data)
    } else {
        dirs::data_dir()
            .ok_or_else(|| LocalmindError::Config("Cannot determine data directory".to_string()))?
    };

    Ok(data_dir.join("localmind").join("models"))
}
