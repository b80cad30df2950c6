//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! where the identity service lives, where credentials are kept, and how
//! often the session is refreshed.
//!
//! Configuration is stored at `~/.config/tokenward/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::session::{DEFAULT_SIGN_IN_PATH, REFRESH_INTERVAL_MINUTES};
use crate::auth::{FileBackend, KeyringBackend, MemoryBackend, SessionOptions, StoreBackend};

/// Application name used for config/data directory paths
const APP_NAME: &str = "tokenward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Overrides `api_base_url`
pub const API_URL_ENV: &str = "TOKENWARD_API_URL";

/// Longest refresh interval honoured from config
const MAX_REFRESH_INTERVAL_MINUTES: u64 = 24 * 60;

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// Where the credential store keeps its entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// `credentials.json` in the data directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Process lifetime only
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub sign_in_path: String,
    pub storage: StorageKind,
    pub refresh_interval_minutes: u64,
    pub last_identifier: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
            storage: StorageKind::default(),
            refresh_interval_minutes: REFRESH_INTERVAL_MINUTES,
            last_identifier: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Holds the file credential store and the log file
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Apply environment overrides on top of the file values
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
        self
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            refresh_interval: Duration::from_secs(
                self.refresh_interval_minutes
                    .clamp(1, MAX_REFRESH_INTERVAL_MINUTES)
                    .saturating_mul(60),
            ),
            sign_in_path: self.sign_in_path.clone(),
            ..SessionOptions::default()
        }
    }

    /// Backend for the configured storage kind, rooted at `data_dir` for files
    pub fn store_backend(&self, data_dir: &Path) -> Arc<dyn StoreBackend> {
        match self.storage {
            StorageKind::File => Arc::new(FileBackend::new(data_dir)),
            StorageKind::Keyring => Arc::new(KeyringBackend::new()),
            StorageKind::Memory => Arc::new(MemoryBackend::new()),
        }
    }
}
