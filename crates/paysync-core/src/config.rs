//! PaySync configuration system.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaySyncConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub deleter: DeleterConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub connectors: Vec<ConnectorEntry>,
}

impl PaySyncConfig {
    /// Load config from the default path (~/.paysync/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::InvalidArgument(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SyncError::InvalidArgument(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::InvalidArgument(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the PaySync home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".paysync")
    }

    /// Reject settings that would make a worker spin or stall.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.page_size == 0 {
            return Err(SyncError::InvalidArgument("scheduler.page_size must be > 0".into()));
        }
        if self.deleter.batch_size == 0 {
            return Err(SyncError::InvalidArgument("deleter.batch_size must be > 0".into()));
        }
        if self.outbox.batch_limit == 0 {
            return Err(SyncError::InvalidArgument("outbox.batch_limit must be > 0".into()));
        }
        if self.outbox.poll_interval_secs == 0 {
            return Err(SyncError::InvalidArgument("outbox.poll_interval_secs must be > 0".into()));
        }
        if self.outbox.cleanup_interval_secs == 0 {
            return Err(SyncError::InvalidArgument("outbox.cleanup_interval_secs must be > 0".into()));
        }
        if self.scheduler.call_timeout_secs == 0 {
            return Err(SyncError::InvalidArgument("scheduler.call_timeout_secs must be > 0".into()));
        }
        if !(self.retry.backoff_multiplier > 0.0) {
            return Err(SyncError::InvalidArgument("retry.backoff_multiplier must be > 0".into()));
        }
        if self.bus.kind == BusKind::Webhook && self.bus.url.as_deref().is_none_or(str::is_empty) {
            return Err(SyncError::InvalidArgument("bus.url is required for the webhook bus".into()));
        }
        for c in &self.connectors {
            if c.provider.is_empty() || c.name.is_empty() {
                return Err(SyncError::InvalidArgument(
                    "connectors entries need a provider and a name".into(),
                ));
            }
            if c.poll_interval_secs == 0 {
                return Err(SyncError::InvalidArgument(format!(
                    "connector '{}': poll_interval_secs must be > 0",
                    c.name
                )));
            }
        }
        Ok(())
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.paysync/paysync.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl StorageConfig {
    /// Path with `~` and environment variables expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::full(&self.path).map(|p| p.into_owned()).unwrap_or_else(|_| self.path.clone()))
    }
}

/// Task-tree interpreter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Fallback page size when the registry has no provider-specific value.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Timeout applied to every plugin call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_page_size() -> u32 { 25 }
fn default_call_timeout() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Outbox publisher and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_poll_interval() -> u64 { 5 }
fn default_batch_limit() -> u32 { 100 }
fn default_max_retries() -> u32 { 10 }
fn default_retention_days() -> u32 { 30 }
fn default_cleanup_interval() -> u64 { 3600 }

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_limit: default_batch_limit(),
            max_retries: default_max_retries(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

/// Backoff policy for idempotent steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
    /// 0 means unlimited.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_interval() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_interval() -> u64 { 60_000 }
fn default_max_attempts() -> u32 { 5 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            max_interval_ms: default_max_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleterConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_batch_size() -> u32 { 1000 }

impl Default for DeleterConfig {
    fn default() -> Self {
        Self { batch_size: default_batch_size() }
    }
}

/// Which message bus transport the publisher uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Log,
    Webhook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A connector declared in the config file, installed on `paysync run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorEntry {
    pub provider: String,
    pub name: String,
    /// Provider-specific settings, handed to the plugin factory as JSON.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
    #[serde(default = "default_connector_poll")]
    pub poll_interval_secs: u64,
}

fn default_connector_poll() -> u64 { 120 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PaySyncConfig::default();
        assert_eq!(config.scheduler.page_size, 25);
        assert_eq!(config.outbox.poll_interval_secs, 5);
        assert_eq!(config.outbox.max_retries, 10);
        assert_eq!(config.deleter.batch_size, 1000);
        assert_eq!(config.bus.kind, BusKind::Log);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config = PaySyncConfig::parse("").unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.outbox.retention_days, 30);
        assert!(config.connectors.is_empty());
    }

    #[test]
    fn test_parse_connectors_and_bus() {
        let toml_str = r#"
            [outbox]
            max_retries = 3

            [bus]
            kind = "webhook"
            url = "http://localhost:9000/events"
            headers = { Authorization = "Bearer t" }

            [[connectors]]
            provider = "dummypay"
            name = "local"
            config = { directory = "/tmp/dummypay" }
        "#;
        let config = PaySyncConfig::parse(toml_str).unwrap();
        assert_eq!(config.outbox.max_retries, 3);
        assert_eq!(config.bus.kind, BusKind::Webhook);
        assert_eq!(config.bus.headers["Authorization"], "Bearer t");
        assert_eq!(config.connectors[0].config["directory"], "/tmp/dummypay");
        assert_eq!(config.connectors[0].poll_interval_secs, 120);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PaySyncConfig::default();
        config.deleter.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = PaySyncConfig::default();
        config.retry.backoff_multiplier = 0.0;
        assert!(config.validate().is_err());

        assert!(PaySyncConfig::parse("[bus]\nkind = \"webhook\"").is_err());
    }

    #[test]
    fn test_zero_intervals_and_timeouts_are_rejected() {
        let err = PaySyncConfig::parse("[outbox]\ncleanup_interval_secs = 0").unwrap_err();
        assert!(err.to_string().contains("cleanup_interval_secs"));

        let err = PaySyncConfig::parse("[scheduler]\ncall_timeout_secs = 0").unwrap_err();
        assert!(err.to_string().contains("call_timeout_secs"));

        let err = PaySyncConfig::parse(
            "[[connectors]]\nprovider = \"dummypay\"\nname = \"local\"\npoll_interval_secs = 0",
        )
        .unwrap_err();
        assert!(err.to_string().contains("'local'"));

        let ok = PaySyncConfig::parse(
            "[outbox]\ncleanup_interval_secs = 1\n[scheduler]\ncall_timeout_secs = 1\n\n\
             [[connectors]]\nprovider = \"dummypay\"\nname = \"local\"\npoll_interval_secs = 1",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_home_dir() {
        let home = PaySyncConfig::home_dir();
        assert!(home.to_string_lossy().contains("paysync"));
    }
}
