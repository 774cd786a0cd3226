use anyhow::{Context, Result};
use fingate_sensor::Score;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::matcher::MatchPolicy;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FINGATE_CONFIG_PATH").unwrap_or("/usr/local/etc/fingate/config.toml"))
});

pub static STORE_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FINGATE_STORE_PREFIX").unwrap_or("/usr/local/etc/fingate"))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Verification accepts a stored identity scoring strictly above this.
    pub acceptance_threshold: Score,
    /// Enrollment treats a capture as already enrolled above this.
    pub identify_threshold: Score,
    /// Consecutive enrollment samples must score strictly above this.
    pub same_finger_threshold: Score,
    pub match_policy: MatchPolicy,
    pub poll_interval_ms: u64,
    pub feedback_hold_secs: f32,
    pub spool_dir: PathBuf,
    /// Attributes asked from the operator when an enrollment completes.
    pub attribute_fields: Vec<String>,
    /// When set, each capture's image is dumped here as PNG.
    pub debug_image_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acceptance_threshold: 200,
            identify_threshold: 200,
            same_finger_threshold: 100,
            match_policy: MatchPolicy::FirstMatch,
            poll_interval_ms: 100,
            feedback_hold_secs: 1.0,
            spool_dir: PathBuf::from("/var/spool/fingate"),
            attribute_fields: vec!["username".to_string()],
            debug_image_dir: None,
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
