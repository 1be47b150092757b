//! Control plane communication.
//!
//! The agent talks to the control plane over a small JSON-over-HTTP API:
//! heartbeats double as the command channel, configuration is polled, and
//! outcome/activity records are pushed best-effort.

pub mod heartbeat;
pub mod reconciler;
pub mod reporter;

use crate::config::{ApiConfig, S3Config};
use crate::engine::Snapshot;
use crate::utils::errors::Result;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Liveness report sent on every heartbeat tick.
#[derive(Debug, Serialize)]
pub struct HeartbeatRequest {
    pub hostname: String,
    pub status: String,
    #[serde(rename = "ipAddress", skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Command embedded in a heartbeat response.
///
/// Unrecognized strings decode as [`RemoteCommand::Unknown`] and are treated
/// as idle ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteCommand {
    #[default]
    Idle,
    BackupNow,
    Update,
    Shutdown,
    SyncSnapshots,
    Restore,
    #[serde(other)]
    Unknown,
}

/// Restore instruction riding on a `restore` heartbeat command.
#[derive(Debug, Clone, Deserialize)]
pub struct RestoreRequest {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default)]
    pub command: RemoteCommand,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "agentID", default)]
    pub agent_id: Option<String>,
    #[serde(rename = "restoreConfig", default)]
    pub restore: Option<RestoreRequest>,
}

/// Raw configuration payload as served by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfigResponse {
    pub success: bool,
    #[serde(default)]
    pub configured: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(rename = "accessKey", default)]
    pub access_key: Option<String>,
    #[serde(rename = "secretKey", default)]
    pub secret_key: Option<String>,
    #[serde(rename = "repoPassword", default)]
    pub repo_password: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Validated remote backup configuration.
///
/// Replaced wholesale each time a complete payload is accepted; never
/// partially merged.
#[derive(Debug, Clone)]
pub struct RemoteBackupConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub repo_password: String,
}

impl RemoteBackupConfig {
    /// Validate a raw payload, falling back to local S3 defaults for the
    /// endpoint and region. Returns `None` when any credential is missing
    /// or empty.
    pub fn from_response(resp: &RemoteConfigResponse, fallback: &S3Config) -> Option<Self> {
        let required = |value: &Option<String>| -> Option<String> {
            value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
        };

        Some(Self {
            endpoint: required(&resp.endpoint).unwrap_or_else(|| fallback.endpoint.clone()),
            region: required(&resp.region).unwrap_or_else(|| fallback.region.clone()),
            bucket: required(&resp.bucket)?,
            access_key: required(&resp.access_key)?,
            secret_key: required(&resp.secret_key)?,
            repo_password: required(&resp.repo_password)?,
        })
    }
}

/// Backup outcome record (`logType: "backup"`).
#[derive(Debug, Serialize)]
pub struct BackupLogRecord {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    pub hostname: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "filesNew")]
    pub files_new: u64,
    #[serde(rename = "filesChanged")]
    pub files_changed: u64,
    #[serde(rename = "dataAdded")]
    pub data_added: u64,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: f64,
    #[serde(rename = "logType")]
    pub log_type: &'static str,
}

/// Free-form activity record (`logType: "activity"`).
#[derive(Debug, Serialize)]
pub struct ActivityLogRecord {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    pub hostname: String,
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(rename = "logType")]
    pub log_type: &'static str,
}

/// Full snapshot list pushed on `sync_snapshots`.
#[derive(Debug, Serialize)]
pub struct SnapshotSyncRequest {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    pub hostname: String,
    pub snapshots: Vec<Snapshot>,
}

/// Terminal status of a restore request.
#[derive(Debug, Serialize)]
pub struct RestoreStatusRequest {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// HTTP client for the control plane API.
///
/// Carries the agent's user-agent on every request and the API key as a
/// bearer token when one is configured.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("palisade-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.key.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base_url, path));
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        req
    }

    pub async fn send_heartbeat(&self, payload: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let response = self
            .request(Method::POST, "/api/agent/heartbeat")
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    pub async fn fetch_config(&self) -> Result<RemoteConfigResponse> {
        let response = self
            .request(Method::GET, "/api/agent/config")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    pub async fn post_log<T: Serialize>(&self, record: &T) -> Result<()> {
        self.request(Method::POST, "/api/agent/log")
            .json(record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn post_snapshots(&self, payload: &SnapshotSyncRequest) -> Result<()> {
        self.request(Method::POST, "/api/agent/snapshots")
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn post_restore_status(&self, payload: &RestoreStatusRequest) -> Result<()> {
        self.request(Method::POST, "/api/restore/status")
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(command: &str) -> HeartbeatResponse {
        serde_json::from_str(&format!(
            r#"{{"success": true, "command": "{command}"}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_known_commands_decode() {
        assert_eq!(response_with("idle").command, RemoteCommand::Idle);
        assert_eq!(response_with("backup_now").command, RemoteCommand::BackupNow);
        assert_eq!(response_with("update").command, RemoteCommand::Update);
        assert_eq!(response_with("shutdown").command, RemoteCommand::Shutdown);
        assert_eq!(
            response_with("sync_snapshots").command,
            RemoteCommand::SyncSnapshots
        );
        assert_eq!(response_with("restore").command, RemoteCommand::Restore);
    }

    #[test]
    fn test_unknown_command_decodes_as_unknown() {
        assert_eq!(
            response_with("reformat_disk").command,
            RemoteCommand::Unknown
        );
    }

    #[test]
    fn test_missing_command_defaults_to_idle() {
        let response: HeartbeatResponse =
            serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert_eq!(response.command, RemoteCommand::Idle);
    }

    #[test]
    fn test_remote_config_requires_all_credentials() {
        let fallback = S3Config::default();
        let raw = r#"{
            "success": true,
            "configured": true,
            "bucket": "client-42",
            "accessKey": "AKIA",
            "secretKey": ""
        }"#;
        let response: RemoteConfigResponse = serde_json::from_str(raw).unwrap();
        assert!(RemoteBackupConfig::from_response(&response, &fallback).is_none());
    }

    #[test]
    fn test_remote_config_falls_back_to_local_s3_defaults() {
        let fallback = S3Config {
            endpoint: "s3.fallback.example".to_string(),
            region: "eu-central-1".to_string(),
        };
        let raw = r#"{
            "success": true,
            "configured": true,
            "bucket": "client-42",
            "accessKey": "AKIA",
            "secretKey": "shh",
            "repoPassword": "hunter2"
        }"#;
        let response: RemoteConfigResponse = serde_json::from_str(raw).unwrap();
        let config = RemoteBackupConfig::from_response(&response, &fallback).unwrap();

        assert_eq!(config.endpoint, "s3.fallback.example");
        assert_eq!(config.region, "eu-central-1");
        assert_eq!(config.bucket, "client-42");
    }

    #[test]
    fn test_backup_log_record_wire_names() {
        let record = BackupLogRecord {
            agent_id: "agent-1".to_string(),
            hostname: "host".to_string(),
            status: "success".to_string(),
            message: None,
            files_new: 1,
            files_changed: 2,
            data_added: 3,
            duration_seconds: 4.0,
            log_type: "backup",
        };
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["agentID"], "agent-1");
        assert_eq!(value["filesNew"], 1);
        assert_eq!(value["dataAdded"], 3);
        assert_eq!(value["durationSeconds"], 4.0);
        assert_eq!(value["logType"], "backup");
        assert!(value.get("message").is_none());
    }
}
