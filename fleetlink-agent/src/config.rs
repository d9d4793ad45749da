//! Agent configuration
//!
//! Handles:
//! - Hub endpoint settings with documented fallback defaults
//! - Publish cadence and companion message
//! - Cross-platform storage under the OS config directory

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub hub: HubConfig,
    /// Seconds between publish ticks.
    pub publish_interval_secs: u64,
    /// Fixed companion phrase sent alongside each metrics publish.
    pub companion_text: String,
    /// Overrides hardware identity detection when set.
    pub device_uuid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
}

impl HubConfig {
    /// Full endpoint URL for the agent's metrics stream.
    pub fn endpoint_url(&self) -> String {
        format!("http://{}:{}/api/metrics-stream", self.host, self.port)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig {
                host: "192.168.245.193".to_string(),
                port: 5100,
            },
            publish_interval_secs: 5,
            companion_text: "dance with me one more time".to_string(),
            device_uuid: None,
        }
    }
}

impl AgentConfig {
    /// Load config from the OS-specific location, falling back to the
    /// defaults when no file exists yet (first run).
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            let config: AgentConfig = toml::from_str(&content)?;
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

        path.push("fleetlink-agent");
        path.push("config.toml");
        Ok(path)
    }
}
