use anyhow::{Context, Result};
use common::{ConfigEntry, WILDCARD};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::validate_enum;

/// Configuration file contents
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub output: Vec<OutputSettings>,
}

/// General settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_name() -> String {
    WILDCARD.to_string()
}

/// One `[[output]]` table
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputSettings {
    /// Output name, persistent identifier or "*"
    #[serde(default = "default_output_name")]
    pub name: String,
    pub image: Option<String>,
    pub color: Option<String>,
    pub mode: Option<String>,
}

impl Config {
    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };
        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path. A missing file yields the
    /// defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("backdrop").join("config.toml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_log_level(&self.general.log_level)
            .context("Invalid general.log_level")?;

        if let Some(output) = self.output.iter().find(|o| o.name.is_empty()) {
            anyhow::bail!("Output entry has an empty name: {:?}", output);
        }

        Ok(())
    }

    fn validate_log_level(&self, level: &str) -> Result<()> {
        validate_enum!(level, "trace", "debug", "info", "warn", "error")
    }

    /// Convert the `[[output]]` tables to config entries, in file order.
    /// Invalid colors and modes are reported and left unset.
    pub fn entries(&self) -> Vec<ConfigEntry> {
        self.output
            .iter()
            .map(|output| {
                let mut entry = ConfigEntry::new(output.name.as_str());
                entry.image = output.image.clone();
                entry.color = output.color.as_deref().and_then(|color| {
                    color
                        .parse()
                        .map_err(|e| log::error!("{} (output '{}')", e, output.name))
                        .ok()
                });
                entry.mode = output.mode.as_deref().and_then(|mode| {
                    mode.parse()
                        .map_err(|e| log::error!("{} (output '{}')", e, output.name))
                        .ok()
                });
                entry
            })
            .collect()
    }
}
