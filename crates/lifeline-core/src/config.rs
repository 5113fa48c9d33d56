//! Configuration resolution for Lifeline.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/lifeline/settings.json)
//! 3. Explicit config file
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Lifeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub checkins: CheckInConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Check-in and confirmation protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckInConfig {
    /// Seconds after the response deadline a code is still accepted.
    pub grace_period_secs: u64,
    /// Wrong codes allowed per challenge session.
    pub max_attempts: u32,
    /// Client-side bound on a single code submission.
    pub confirmation_timeout_secs: u64,
}

impl Default for CheckInConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 15 * 60,
            max_attempts: 5,
            confirmation_timeout_secs: 12,
        }
    }
}

/// Server-side escalation sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub sweep_interval_secs: u64,
    /// Per-channel delivery attempts before a failed delivery is given up.
    pub max_delivery_attempts: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            max_delivery_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotificationConfig {
    /// Escalations end as `missed` and nothing is sent.
    pub suppress: bool,
    pub email_gateway_url: Option<String>,
    pub sms_gateway_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Reject settings the escalation guarantees cannot hold under.
    pub fn validate(&self) -> Result<()> {
        if self.checkins.max_attempts == 0 {
            return Err(Error::Config("checkins.max_attempts must be at least 1".into()));
        }
        if self.checkins.confirmation_timeout_secs == 0 {
            return Err(Error::Config(
                "checkins.confirmation_timeout_secs must be at least 1".into(),
            ));
        }
        if self.reconciler.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "reconciler.sweep_interval_secs must be at least 1".into(),
            ));
        }
        if self.reconciler.max_delivery_attempts == 0 {
            return Err(Error::Config(
                "reconciler.max_delivery_attempts must be at least 1".into(),
            ));
        }
        // A sweep must run at least twice inside the grace window.
        if self.reconciler.sweep_interval_secs > self.checkins.grace_period_secs / 2 {
            return Err(Error::Config(format!(
                "reconciler.sweep_interval_secs ({}) must not exceed half of checkins.grace_period_secs ({})",
                self.reconciler.sweep_interval_secs, self.checkins.grace_period_secs
            )));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(path) = explicit {
        config = load_config_file(path)?;
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("lifeline").join("settings.json"))
}

/// Default location of the server database.
pub fn database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("lifeline").join("lifeline.db"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("LIFELINE_GRACE_PERIOD_SECS").and_then(|v| v.parse().ok()) {
        config.checkins.grace_period_secs = n;
    }
    if let Some(n) = var("LIFELINE_SWEEP_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.reconciler.sweep_interval_secs = n;
    }
    if let Some(n) = var("LIFELINE_MAX_DELIVERY_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.reconciler.max_delivery_attempts = n;
    }
    if let Some(level) = var("LIFELINE_LOG_LEVEL") {
        config.server.log_level = level;
    }
    if let Some(flag) = var("LIFELINE_SUPPRESS_NOTIFICATIONS") {
        config.notifications.suppress = matches!(flag.as_str(), "1" | "true" | "yes");
    }
}
