use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEVICE_PATH: &str = "/Volumes/iPod";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_device_path")]
    pub device_path: PathBuf,
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub repeat_scrobbles: bool,
    #[serde(default = "default_clear_counts")]
    pub clear_counts: bool,
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            service_url: None,
            session_key: None,
            repeat_scrobbles: false,
            clear_counts: default_clear_counts(),
            submit_timeout_secs: default_submit_timeout_secs(),
        }
    }
}

fn default_device_path() -> PathBuf {
    PathBuf::from(DEFAULT_DEVICE_PATH)
}

fn default_clear_counts() -> bool {
    true
}

fn default_submit_timeout_secs() -> u64 {
    30
}

pub fn default_config_path() -> PathBuf {
    let fallback = PathBuf::from(".config/clickwheel/config.json");
    dirs::home_dir().map_or(fallback, |home| {
        home.join(".config/clickwheel/config.json")
    })
}

// The ledger and retry queue live beside the config file, so an overridden
// config path relocates all mutable state with it.
pub fn ledger_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name("ledger.json")
}

pub fn queue_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name("retry-queue.json")
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading config at {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing config at {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating config directory {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(config).context("Failed serializing config to JSON")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing config at {}", path.display()))?;
    Ok(())
}
