//! Best-effort reporting of backup outcomes and agent activity.
//!
//! The control plane is the system of record for history: delivery
//! failures are logged locally and dropped, nothing is persisted or
//! retried on the agent side.

use crate::agent::state::SharedState;
use crate::control::{
    ActivityLogRecord, ApiClient, BackupLogRecord, RestoreStatusRequest, SnapshotSyncRequest,
};
use crate::engine::{BackupResult, Snapshot};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct LogReporter {
    client: Arc<ApiClient>,
    state: SharedState,
}

impl LogReporter {
    pub fn new(client: Arc<ApiClient>, state: SharedState) -> Self {
        Self { client, state }
    }

    /// Post a structured backup-outcome record.
    pub async fn report_backup(&self, result: &BackupResult) {
        let identity = self.state.identity().await;
        let record = BackupLogRecord {
            agent_id: identity.agent_id,
            hostname: identity.hostname,
            status: if result.success { "success" } else { "failed" }.to_string(),
            message: result.error.clone(),
            files_new: result.files_new,
            files_changed: result.files_changed,
            data_added: result.bytes_added,
            duration_seconds: result.duration_seconds,
            log_type: "backup",
        };

        if let Err(e) = self.client.post_log(&record).await {
            warn!("failed to deliver backup log: {e}");
        }
    }

    /// Post a free-form activity record.
    pub async fn report_activity(
        &self,
        level: &str,
        message: String,
        details: Option<serde_json::Value>,
    ) {
        let identity = self.state.identity().await;
        let record = ActivityLogRecord {
            agent_id: identity.agent_id,
            hostname: identity.hostname,
            level: level.to_string(),
            message,
            details,
            log_type: "activity",
        };

        if let Err(e) = self.client.post_log(&record).await {
            warn!("failed to deliver activity log: {e}");
        }
    }

    /// Fire-and-forget variant of [`report_activity`] for callers that must
    /// not suspend on delivery.
    ///
    /// [`report_activity`]: Self::report_activity
    pub fn activity_detached(
        &self,
        level: &'static str,
        message: String,
        details: Option<serde_json::Value>,
    ) {
        let reporter = self.clone();
        tokio::spawn(async move {
            reporter.report_activity(level, message, details).await;
        });
    }

    /// Push the full snapshot list to the control plane.
    pub async fn report_snapshots(&self, snapshots: Vec<Snapshot>) {
        let identity = self.state.identity().await;
        let count = snapshots.len();
        let payload = SnapshotSyncRequest {
            agent_id: identity.agent_id,
            hostname: identity.hostname,
            snapshots,
        };

        match self.client.post_snapshots(&payload).await {
            Ok(()) => tracing::debug!(count, "snapshot list synced"),
            Err(e) => warn!("failed to sync snapshot list: {e}"),
        }
    }

    /// Post the terminal status of a restore request.
    pub async fn report_restore_status(
        &self,
        request_id: &str,
        status: &str,
        message: Option<String>,
    ) {
        let payload = RestoreStatusRequest {
            request_id: request_id.to_string(),
            status: status.to_string(),
            message,
        };

        if let Err(e) = self.client.post_restore_status(&payload).await {
            warn!("failed to deliver restore status: {e}");
        }
    }
}
