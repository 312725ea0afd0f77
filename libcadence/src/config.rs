//! Configuration management for Cadence

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default, rename = "webhook")]
    pub webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Job runner and allocator tuning. All durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval: u64,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub initial_backoff: u64,
    pub pause_recheck: u64,
    pub default_retry_after: u64,
    pub search_horizon_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: 5,
            concurrency: 5,
            max_attempts: 4,
            initial_backoff: 2,
            pause_recheck: 900,
            default_retry_after: 60,
            search_horizon_days: 28,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub identity_file: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            identity_file: "~/.config/cadence/vault.key".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: String,
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            level: "info".to_string(),
        }
    }
}

/// A generic JSON-over-HTTP platform registered under `name`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub publish_url: String,
    pub refresh_url: String,
    #[serde(default)]
    pub exchange_url: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout: u64,
}

fn default_webhook_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path.
    ///
    /// `CADENCE_DB_PATH` overrides `database.path` after parsing.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;

        if let Ok(db_path) = std::env::var("CADENCE_DB_PATH") {
            if !db_path.trim().is_empty() {
                config.database.path = db_path;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/cadence/cadence.db".to_string(),
            },
            scheduler: SchedulerConfig::default(),
            vault: VaultConfig::default(),
            logging: LoggingSection::default(),
            webhooks: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }

        let scheduler = &self.scheduler;
        if scheduler.concurrency == 0 {
            return Err(invalid("scheduler.concurrency", "must be at least 1"));
        }
        if scheduler.max_attempts == 0 {
            return Err(invalid("scheduler.max_attempts", "must be at least 1"));
        }
        if scheduler.search_horizon_days <= 0 {
            return Err(invalid("scheduler.search_horizon_days", "must be positive"));
        }
        if scheduler.poll_interval == 0 {
            return Err(invalid("scheduler.poll_interval", "must be at least 1"));
        }

        let mut names = HashSet::new();
        for webhook in &self.webhooks {
            if webhook.name.trim().is_empty() {
                return Err(invalid("webhook.name", "must not be empty"));
            }
            if !names.insert(webhook.name.as_str()) {
                return Err(invalid(
                    "webhook.name",
                    &format!("duplicate platform name '{}'", webhook.name),
                ));
            }
        }

        Ok(())
    }

    /// Database path with `~` expanded
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }

    /// Vault identity path with `~` expanded
    pub fn identity_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.vault.identity_file).to_string())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::CadenceError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following XDG Base Directory conventions
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CADENCE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("cadence").join("config.toml"))
}
