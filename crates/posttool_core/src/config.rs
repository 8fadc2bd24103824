use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PROGRESS_EVERY: usize = 500;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ToolConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub renumber: RenumberSection,
    #[serde(default)]
    pub batch: BatchSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DatabaseSection {
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RenumberSection {
    pub verify: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BatchSection {
    pub suppress_notifications: Option<bool>,
    pub progress_every: Option<usize>,
}

impl ToolConfig {
    /// Resolve the busy timeout: env POSTTOOL_BUSY_TIMEOUT_MS > config > default.
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout_with_lookup(|key| env::var(key).ok())
    }

    fn busy_timeout_with_lookup<F>(&self, lookup_env: F) -> Duration
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = lookup_env("POSTTOOL_BUSY_TIMEOUT_MS")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .or(self.database.busy_timeout_ms)
            .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);
        Duration::from_millis(millis)
    }

    pub fn verify_renumber(&self) -> bool {
        self.renumber.verify.unwrap_or(true)
    }

    /// Resolve notification suppression for batch runs: env > config > true.
    pub fn suppress_notifications(&self) -> bool {
        self.suppress_notifications_with_lookup(|key| env::var(key).ok())
    }

    fn suppress_notifications_with_lookup<F>(&self, lookup_env: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup_env("POSTTOOL_SUPPRESS_NOTIFICATIONS")
            && let Some(flag) = parse_flag(&value)
        {
            return flag;
        }
        self.batch.suppress_notifications.unwrap_or(true)
    }

    pub fn progress_every(&self) -> usize {
        self.batch
            .progress_every
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_PROGRESS_EVERY)
    }
}

/// Load and parse a ToolConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ToolConfig> {
    if !config_path.exists() {
        return Ok(ToolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ToolConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
