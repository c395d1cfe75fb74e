//! Shell configuration.
//!
//! Loaded from `$XDG_CONFIG_HOME/gnomeconnect/shell.toml`; a missing file
//! yields defaults and writes them back so the user has something to edit.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sftp::SftpCommands;

/// Shell configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine connection
    #[serde(default)]
    pub engine: EngineSection,

    /// Shell behavior
    #[serde(default)]
    pub shell: ShellSection,

    /// File-browse (sftp) commands
    #[serde(default)]
    pub sftp: SftpSection,
}

/// Engine connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSection {
    /// Bus name override, mainly for test instances
    #[serde(default)]
    pub bus_name: Option<String>,
}

/// Shell behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellSection {
    /// Time budget for each external call (notifications, media players)
    /// in seconds
    #[serde(default = "default_external_call_timeout")]
    pub external_call_timeout_secs: u64,
}

/// File-browse (sftp) command settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpSection {
    /// Command that mounts an sftp location, password fed on stdin
    #[serde(default = "default_mount_command")]
    pub mount_command: String,

    /// File manager opened on the mounted location
    #[serde(default = "default_open_command")]
    pub open_command: String,

    /// Mount timeout in seconds
    #[serde(default = "default_mount_timeout")]
    pub mount_timeout_secs: u64,
}

fn default_external_call_timeout() -> u64 {
    5
}

fn default_mount_command() -> String {
    "gvfs-mount".to_string()
}

fn default_open_command() -> String {
    "nautilus".to_string()
}

fn default_mount_timeout() -> u64 {
    30
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            external_call_timeout_secs: default_external_call_timeout(),
        }
    }
}

impl Default for SftpSection {
    fn default() -> Self {
        Self {
            mount_command: default_mount_command(),
            open_command: default_open_command(),
            mount_timeout_secs: default_mount_timeout(),
        }
    }
}

impl Config {
    /// Per-user config directory, created on demand.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("gnomeconnect");
        fs::create_dir_all(&dir).context("Failed to create config directory")?;
        Ok(dir)
    }

    /// Load configuration, writing defaults on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_dir()?.join("shell.toml");

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("shell.toml");
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.shell.external_call_timeout_secs)
    }

    pub fn sftp_commands(&self) -> SftpCommands {
        SftpCommands {
            mount_command: self.sftp.mount_command.clone(),
            open_command: self.sftp.open_command.clone(),
            mount_timeout: Duration::from_secs(self.sftp.mount_timeout_secs),
        }
    }
}
