//! Persistent CLI configuration
//!
//! Stores tunnel manager settings in ~/.iaptun/config.json

use anyhow::{Context, Result};
use iaptun_client::TunnelConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration manager
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for the per-user config file
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::at_path(home.join(".iaptun").join("config.json")))
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration from disk
    pub fn load(&self) -> Result<TunnelConfig> {
        // Return default config if file doesn't exist
        if !self.path.exists() {
            return Ok(TunnelConfig::default());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))?;

        let config: TunnelConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", self.path))?;

        Ok(config)
    }

    /// Save the configuration to disk
    pub fn save(&self, config: &TunnelConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.path, json)
            .context(format!("Failed to write config file: {:?}", self.path))?;

        Ok(())
    }

    /// Set the helper program used for helper-process tunnels
    pub fn set_helper_program(&self, program: String) -> Result<()> {
        let mut config = self.load()?;
        config.helper_program = program;
        self.save(&validated(config)?)
    }

    /// Set the default connect timeout
    pub fn set_connect_timeout(&self, timeout: Duration) -> Result<()> {
        let mut config = self.load()?;
        config.connect_timeout = timeout;
        self.save(&validated(config)?)
    }
}

fn validated(config: TunnelConfig) -> Result<TunnelConfig> {
    TunnelConfig::builder()
        .port_range(config.port_range())
        .helper_program(config.helper_program)
        .helper_poll_attempts(config.helper_poll_attempts)
        .connect_timeout(config.connect_timeout)
        .probe_timeout(config.probe_timeout)
        .build()
        .map_err(anyhow::Error::msg)
}
