//! Configuration management for the agent.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Everything here is local bootstrap configuration; the backup credentials
//! themselves come from the control plane at runtime.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location probed when no `--config` flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/palisade/agent.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub s3: S3Config,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Control plane base URL
    #[serde(default = "default_api_url")]
    pub url: String,

    /// Agent API key, sent as a bearer token when non-empty
    #[serde(default)]
    pub key: String,

    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Seconds between configuration polls while unconfigured
    #[serde(default = "default_config_poll_interval")]
    pub config_poll_interval_secs: u64,

    /// Per-request timeout for control plane calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Fallback S3 endpoint when the control plane omits one
    #[serde(default = "default_s3_endpoint")]
    pub endpoint: String,

    /// Fallback S3 region
    #[serde(default = "default_s3_region")]
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the restic executable
    #[serde(default = "default_engine_path")]
    pub path: PathBuf,

    /// Wall-clock limit for a single engine invocation
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory backed up on trigger
    #[serde(default = "default_backup_path")]
    pub path: PathBuf,

    /// Cron expression (seconds-resolution) for unattended backups
    #[serde(default = "default_backup_schedule")]
    pub schedule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_api_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_config_poll_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    10
}

fn default_s3_endpoint() -> String {
    "s3.amazonaws.com".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_engine_path() -> PathBuf {
    PathBuf::from("restic")
}

fn default_operation_timeout() -> u64 {
    3600
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("/home")
}

fn default_backup_schedule() -> String {
    // Daily at 02:00
    "0 0 2 * * *".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            key: String::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            config_poll_interval_secs: default_config_poll_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: default_s3_endpoint(),
            region: default_s3_region(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: default_engine_path(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            path: default_backup_path(),
            schedule: default_backup_schedule(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            s3: S3Config::default(),
            engine: EngineConfig::default(),
            backup: BackupConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from an explicit path, the default path if it
    /// exists, or built-in defaults. Environment overrides always apply.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            return Self::from_file(default_path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PALISADE_API_URL") {
            self.api.url = v;
        }
        if let Ok(v) = std::env::var("PALISADE_API_KEY") {
            self.api.key = v;
        }
        if let Ok(v) = std::env::var("PALISADE_S3_ENDPOINT") {
            self.s3.endpoint = v;
        }
        if let Ok(v) = std::env::var("PALISADE_S3_REGION") {
            self.s3.region = v;
        }
        if let Ok(v) = std::env::var("PALISADE_ENGINE_PATH") {
            self.engine.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PALISADE_BACKUP_PATH") {
            self.backup.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PALISADE_BACKUP_SCHEDULE") {
            self.backup.schedule = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.heartbeat_interval_secs, 60);
        assert_eq!(config.api.request_timeout_secs, 10);
        assert_eq!(config.engine.path, PathBuf::from("restic"));
        assert_eq!(config.engine.operation_timeout_secs, 3600);
        assert!(config.api.key.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [api]
            url = "https://backups.example.net"
            key = "secret-key"

            [backup]
            path = "/srv/data"
            "#,
        )
        .unwrap();

        assert_eq!(config.api.url, "https://backups.example.net");
        assert_eq!(config.api.key, "secret-key");
        assert_eq!(config.backup.path, PathBuf::from("/srv/data"));
        // Untouched sections keep their defaults
        assert_eq!(config.api.heartbeat_interval_secs, 60);
        assert_eq!(config.backup.schedule, "0 0 2 * * *");
    }

    #[test]
    fn test_env_override_wins() {
        std::env::set_var("PALISADE_API_URL", "https://override.example.com");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("PALISADE_API_URL");

        assert_eq!(config.api.url, "https://override.example.com");
    }
}
