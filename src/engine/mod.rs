//! Wrapper around the restic backup engine.
//!
//! Restic is invoked as a subprocess with structured (`--json`) output.
//! Credentials for the S3 backend and the repository password are passed
//! through the child process environment, never on the command line, and
//! are never logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::utils::format::format_bytes;

/// stderr fragments restic emits when the repository has never been
/// initialized. Matched as substrings; exit codes are not reliable here.
const MISSING_REPO_MARKERS: [&str; 3] = [
    "repository does not exist",
    "unable to open config file",
    "Is there a repository at",
];

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine executable not found: {0}")]
    EngineNotFound(PathBuf),

    #[error("backup path does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("repository initialization failed: {0}")]
    RepositoryInit(String),

    #[error("engine operation timed out after {0}s")]
    Timeout(u64),

    #[error("failed to decode engine output: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to run engine: {0}")]
    Io(std::io::Error),

    #[error("unexpected engine failure: {0}")]
    Unexpected(String),
}

/// Connection settings for one restic repository.
///
/// `path` is always the agent's hostname, which gives every machine an
/// isolated repository under the shared bucket.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub endpoint: String,
    pub bucket: String,
    pub path: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub password: String,
}

/// Outcome of a single backup run.
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub success: bool,
    pub snapshot_id: Option<String>,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub bytes_added: u64,
    pub bytes_processed: u64,
    pub duration_seconds: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BackupResult {
    fn zeroed(duration_seconds: f64) -> Self {
        Self {
            success: true,
            snapshot_id: None,
            files_new: 0,
            files_changed: 0,
            files_unmodified: 0,
            bytes_added: 0,
            bytes_processed: 0,
            duration_seconds,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Build a failed result carrying the engine's error text.
    pub fn failed(error: String, duration_seconds: f64) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::zeroed(duration_seconds)
        }
    }
}

/// A snapshot as reported by `restic snapshots --json`.
///
/// Deserialized from restic's snake_case output and re-serialized with the
/// control plane's field names when synced upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(rename(deserialize = "short_id", serialize = "shortID"))]
    pub short_id: String,
    pub time: DateTime<Utc>,
    pub hostname: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Terminal summary record of `restic backup --json`.
#[derive(Debug, Deserialize)]
struct BackupSummary {
    message_type: String,
    #[serde(default)]
    files_new: u64,
    #[serde(default)]
    files_changed: u64,
    #[serde(default)]
    files_unmodified: u64,
    #[serde(default)]
    data_added: u64,
    #[serde(default)]
    total_bytes_processed: u64,
    #[serde(default)]
    total_duration: f64,
    #[serde(default)]
    snapshot_id: Option<String>,
}

struct EngineOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl EngineOutput {
    fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Handle to a configured restic installation and its target repository.
pub struct ResticWrapper {
    repo: RepositoryConfig,
    binary: PathBuf,
    timeout: Duration,
}

impl ResticWrapper {
    /// Create a wrapper and probe the executable with `restic version`.
    /// A missing binary surfaces as [`EngineError::EngineNotFound`] before
    /// the repository is ever touched.
    pub async fn new(
        binary: PathBuf,
        repo: RepositoryConfig,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let wrapper = Self {
            repo,
            binary,
            timeout,
        };
        let version = wrapper.probe_version().await?;
        info!(version = %version, "restic engine detected");
        Ok(wrapper)
    }

    /// The derived repository address: `s3:<endpoint>/<bucket>/<hostname>`.
    pub fn repository_url(&self) -> String {
        format!(
            "s3:{}/{}/{}",
            self.repo.endpoint, self.repo.bucket, self.repo.path
        )
    }

    /// Run `restic version` and return the reported version line.
    pub async fn probe_version(&self) -> Result<String, EngineError> {
        let out = self.run_command(&["version"]).await?;
        if !out.status.success() {
            return Err(EngineError::Unexpected(out.stderr_text()));
        }
        Ok(out.stdout_text().trim().to_string())
    }

    /// Make sure the repository exists, initializing it on first use.
    ///
    /// A listing against an initialized repository succeeds and makes this
    /// a cheap no-op, so calling it repeatedly is safe.
    pub async fn ensure_repository(&self) -> Result<(), EngineError> {
        let out = self.run_command(&["snapshots", "--json"]).await?;
        if out.status.success() {
            debug!(repository = %self.repository_url(), "repository already initialized");
            return Ok(());
        }

        let stderr = out.stderr_text();
        if !MISSING_REPO_MARKERS.iter().any(|m| stderr.contains(m)) {
            return Err(EngineError::Unexpected(stderr));
        }

        info!(repository = %self.repository_url(), "initializing new repository");
        let init = self.run_command(&["init"]).await?;
        if !init.status.success() {
            return Err(EngineError::RepositoryInit(init.stderr_text()));
        }
        Ok(())
    }

    /// Back up `target` into the repository.
    ///
    /// A non-zero engine exit yields a failed [`BackupResult`] carrying the
    /// engine's stderr verbatim; a zero exit without a summary record is a
    /// success with zero-valued counters.
    pub async fn run_backup(&self, target: &Path) -> Result<BackupResult, EngineError> {
        if !target.exists() {
            return Err(EngineError::PathNotFound(target.to_path_buf()));
        }

        info!(path = %target.display(), repository = %self.repository_url(), "starting backup");
        let started = Instant::now();
        let target_arg = target.to_string_lossy();
        let out = self
            .run_command(&["backup", target_arg.as_ref(), "--json"])
            .await?;
        let elapsed = started.elapsed().as_secs_f64();

        if !out.status.success() {
            let stderr = out.stderr_text();
            warn!(path = %target.display(), "backup failed: {}", stderr.trim());
            return Ok(BackupResult::failed(stderr, elapsed));
        }

        let result = match parse_summary(&out.stdout_text()) {
            Some(summary) => BackupResult {
                success: true,
                snapshot_id: summary.snapshot_id,
                files_new: summary.files_new,
                files_changed: summary.files_changed,
                files_unmodified: summary.files_unmodified,
                bytes_added: summary.data_added,
                bytes_processed: summary.total_bytes_processed,
                duration_seconds: summary.total_duration,
                error: None,
                timestamp: Utc::now(),
            },
            // A run with nothing to report may omit the summary entirely.
            None => BackupResult::zeroed(elapsed),
        };

        info!(
            snapshot = result.snapshot_id.as_deref().unwrap_or("none"),
            added = %format_bytes(result.bytes_added),
            "backup finished: {} new, {} changed, {} unmodified",
            result.files_new,
            result.files_changed,
            result.files_unmodified,
        );
        Ok(result)
    }

    /// List every snapshot in the repository.
    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>, EngineError> {
        let out = self.run_command(&["snapshots", "--json"]).await?;
        if !out.status.success() {
            return Err(EngineError::Unexpected(out.stderr_text()));
        }
        let snapshots = serde_json::from_str(&out.stdout_text())?;
        Ok(snapshots)
    }

    /// Restore a snapshot into `target`.
    pub async fn restore(&self, snapshot_id: &str, target: &Path) -> Result<(), EngineError> {
        info!(snapshot = snapshot_id, target = %target.display(), "restoring snapshot");
        let target_arg = target.to_string_lossy();
        let out = self
            .run_command(&["restore", snapshot_id, "--target", target_arg.as_ref()])
            .await?;
        if !out.status.success() {
            return Err(EngineError::Unexpected(out.stderr_text()));
        }
        Ok(())
    }

    fn repo_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("AWS_ACCESS_KEY_ID", self.repo.access_key.clone()),
            ("AWS_SECRET_ACCESS_KEY", self.repo.secret_key.clone()),
            ("AWS_DEFAULT_REGION", self.repo.region.clone()),
            ("RESTIC_REPOSITORY", self.repository_url()),
            ("RESTIC_PASSWORD", self.repo.password.clone()),
        ]
    }

    async fn run_command(&self, args: &[&str]) -> Result<EngineOutput, EngineError> {
        debug!(engine = %self.binary.display(), ?args, "invoking engine");

        let mut child = tokio::process::Command::new(&self.binary)
            .args(args)
            .envs(self.repo_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EngineError::EngineNotFound(self.binary.clone()),
                _ => EngineError::Io(e),
            })?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        // Drain stdout/stderr concurrently with wait(); a chatty child would
        // otherwise fill the pipe buffer and deadlock.
        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                let status = status.map_err(EngineError::Io)?;
                Ok(EngineOutput { status, stdout, stderr })
            } => result,
            _ = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                Err(EngineError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

/// Scan line-delimited engine output for the terminal summary record.
///
/// Progress records and unparsable lines are skipped; the first record
/// whose `message_type` is `summary` wins.
fn parse_summary(stdout: &str) -> Option<BackupSummary> {
    for line in stdout.lines() {
        let Ok(record) = serde_json::from_str::<BackupSummary>(line) else {
            continue;
        };
        if record.message_type == "summary" {
            return Some(record);
        }
    }
    None
}
