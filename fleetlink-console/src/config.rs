//! Console configuration
//!
//! Backend and hub endpoints with documented fallback defaults, stored
//! under the OS config directory.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Base URL of the backend REST API.
    pub backend_url: String,
    /// Hub endpoint the notification router subscribes to.
    pub notifications_hub_url: String,
    /// Hub endpoint for device commands; normalized with a `/hub`
    /// suffix at connect time.
    pub control_hub_url: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://192.168.1.87:5100".to_string(),
            notifications_hub_url: "http://192.168.1.87:5100/api/admins/hub".to_string(),
            control_hub_url: "http://192.168.1.87:5100/api".to_string(),
        }
    }
}

impl ConsoleConfig {
    /// Load config from the OS-specific location, falling back to the
    /// defaults when no file exists yet.
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            let config: ConsoleConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the OS-specific location.
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path()?;

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&config_path, content).await?;
        Ok(())
    }

    /// OS-specific config file path.
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("fleetlink-console");
        path.push("config.toml");
        Ok(path)
    }
}
