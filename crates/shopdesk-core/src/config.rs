//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the API base URL, cache timing, request limits, the
//! session storage backend and the last used username.
//!
//! Configuration is stored at `~/.config/shopdesk/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::api::DispatchConfig;
use crate::auth::SESSION_STORAGE_KEY;
use crate::cache::CacheConfig;
use crate::console::ConsoleConfig;
use crate::store::{DurableStore, FileStore, KeyringStore, MemoryStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "shopdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/";

/// Where the persisted session slice lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    /// Nothing survives the process
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub gc_delay_secs: u64,
    pub max_age_secs: Option<u64>,
    pub request_timeout_secs: u64,
    pub rate_limit_retries: u32,
    pub storage: StorageBackend,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            gc_delay_secs: 60,
            max_age_secs: None,
            request_timeout_secs: 30,
            rate_limit_retries: 3,
            storage: StorageBackend::File,
            last_username: None,
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
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory used by the file storage backend
    pub fn storage_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn base_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base URL: {}", self.base_url))?;
        if url.cannot_be_a_base() {
            anyhow::bail!("Base URL cannot carry a path: {}", self.base_url);
        }
        // Endpoint paths are appended under the base path
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    pub fn console_config(&self) -> Result<ConsoleConfig> {
        let mut dispatch = DispatchConfig::new(self.base_url()?);
        dispatch.timeout = Duration::from_secs(self.request_timeout_secs);
        dispatch.rate_limit_retries = self.rate_limit_retries;

        Ok(ConsoleConfig {
            cache: CacheConfig {
                gc_delay: Duration::from_secs(self.gc_delay_secs),
                max_age: self.max_age_secs.map(Duration::from_secs),
            },
            dispatch,
            storage_key: SESSION_STORAGE_KEY.to_string(),
        })
    }

    pub fn open_store(&self) -> Result<Arc<dyn DurableStore>> {
        let store: Arc<dyn DurableStore> = match self.storage {
            StorageBackend::File => Arc::new(FileStore::new(self.storage_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStore::new()),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}
