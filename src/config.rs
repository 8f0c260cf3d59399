use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "termchat";
const CONFIG_FILE_NAME: &str = "config.toml";
const HISTORY_DIR_NAME: &str = "history";

pub const DEFAULT_HOST: &str = "http://localhost:11434";

// --- Application configuration ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SystemConfig {
    #[serde(default)]
    pub message: String,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            storage: StorageConfig {
                path: default_history_dir(),
            },
            system: SystemConfig::default(),
        }
    }
}

/// `<config_dir>/termchat/config.toml`, or `./.termchat/config.toml` when the
/// platform has no config directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{APP_DIR_NAME}")))
        .join(CONFIG_FILE_NAME)
}

pub fn default_history_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{APP_DIR_NAME}")))
        .join(HISTORY_DIR_NAME)
}

impl Config {
    /// Reads the config at `path`, writing a default one first if it doesn't
    /// exist. A non-empty `host_override` replaces the host for this run only.
    pub fn load_or_create(path: &Path, host_override: Option<&str>) -> Result<Self> {
        let mut config = if path.exists() {
            let data = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str::<Config>(&data)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            log::info!("No config at {}, writing defaults", path.display());
            let config = Config::default();
            config.save(path)?;
            config
        };

        if config.storage.path.as_os_str().is_empty() {
            config.storage.path = default_history_dir();
        }
        if let Some(host) = host_override.map(str::trim).filter(|h| !h.is_empty()) {
            log::debug!("Host overridden from command line: {}", host);
            config.host = host.to_string();
        }
        config.host = config.host.trim_end_matches('/').to_string();

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
        }
        fs::write(path, data).with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Updates the system message and writes the config back to `path`.
    pub fn set_system_message(&mut self, message: &str, path: &Path) -> Result<()> {
        self.system.message = message.trim().to_string();
        log::info!("System message updated ({} chars)", self.system.message.len());
        self.save(path)
    }

    pub fn system_message(&self) -> Option<&str> {
        let message = self.system.message.trim();
        (!message.is_empty()).then_some(message)
    }
}
