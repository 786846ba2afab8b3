//! Configuration portal: TOML round-trip for the application profile.
//!
//! Wraps the loaded [`AppConfig`] in `Arc<RwLock<T>>` so the demo wiring and
//! future UI code can share one copy. Loading is tolerant: a missing file
//! yields defaults, a corrupt file is logged and replaced by defaults on the
//! next save.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::AppConfig;

const CONFIG_DIR: &str = ".config/chatlink";
const CONFIG_FILE: &str = "config.toml";

pub struct ConfigPortal {
    config: Arc<RwLock<AppConfig>>,
}

impl ConfigPortal {
    /// Loads the profile from disk, falling back to defaults when the file
    /// is missing or unreadable.
    pub async fn load() -> Result<Self> {
        let path = config_file_path();

        let config = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    debug!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse {}, using defaults: {}",
                        path.display(),
                        e
                    );
                    AppConfig::default()
                }
            },
            Err(e) => {
                warn!(
                    "Could not read {}, using defaults: {}",
                    path.display(),
                    e
                );
                AppConfig::default()
            }
        };

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
        })
    }

    /// Writes a default configuration file when none exists yet.
    pub async fn ensure_default_config() -> Result<()> {
        let path = config_file_path();
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check config file: {}", e))?
        {
            return Ok(());
        }

        info!("Creating default configuration at {}", path.display());

        let dir = config_dir_path();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| eyre!("Failed to create config directory: {}", e))?;

        let content = toml::to_string_pretty(&AppConfig::default())
            .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| eyre!("Failed to write default config: {}", e))?;

        Ok(())
    }

    /// Persists the current in-memory profile.
    pub async fn save(&self) -> Result<()> {
        let path = config_file_path();
        let config = self.config.read().await.clone();

        let content = toml::to_string_pretty(&config)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;

        debug!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Snapshot of the current profile.
    pub async fn snapshot(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Applies an in-place update to the profile.
    pub async fn update(&self, apply: impl FnOnce(&mut AppConfig)) {
        let mut guard = self.config.write().await;
        apply(&mut guard);
    }
}

fn config_dir_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("No home directory found, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path
}

fn config_file_path() -> PathBuf {
    let mut path = config_dir_path();
    path.push(CONFIG_FILE);
    path
}
