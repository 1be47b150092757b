//! Remote command interpretation.
//!
//! Commands arrive solely as a side effect of heartbeat responses and are
//! queued onto an in-process channel; this dispatcher is the single
//! consumer. Engine work is spawned detached so the queue keeps draining
//! while a backup or restore runs.

use crate::agent::state::SharedState;
use crate::control::reporter::LogReporter;
use crate::control::{HeartbeatResponse, RemoteCommand, RestoreRequest};
use crate::engine::BackupResult;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What caused a backup trigger; carried into skip/outcome records.
#[derive(Debug, Clone, Copy)]
pub enum BackupTrigger {
    Initial,
    Remote,
    Scheduled,
}

impl BackupTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupTrigger::Initial => "initial",
            BackupTrigger::Remote => "remote",
            BackupTrigger::Scheduled => "scheduled",
        }
    }
}

/// An actionable command on the dispatcher queue.
#[derive(Debug)]
pub enum AgentCommand {
    BackupNow { trigger: BackupTrigger },
    SyncSnapshots,
    Restore(RestoreRequest),
    Update,
    Shutdown,
}

impl AgentCommand {
    /// Map a heartbeat response to a queueable command. Idle and
    /// unrecognized commands map to `None`.
    pub fn from_heartbeat(response: &HeartbeatResponse) -> Option<Self> {
        match response.command {
            RemoteCommand::Idle => None,
            RemoteCommand::Unknown => {
                warn!("ignoring unrecognized command from control plane");
                None
            }
            RemoteCommand::BackupNow => Some(AgentCommand::BackupNow {
                trigger: BackupTrigger::Remote,
            }),
            RemoteCommand::Update => Some(AgentCommand::Update),
            RemoteCommand::Shutdown => Some(AgentCommand::Shutdown),
            RemoteCommand::SyncSnapshots => Some(AgentCommand::SyncSnapshots),
            RemoteCommand::Restore => match response.restore.clone() {
                Some(request) => Some(AgentCommand::Restore(request)),
                None => {
                    warn!("restore command arrived without a restore config, ignoring");
                    None
                }
            },
        }
    }
}

pub struct CommandDispatcher {
    state: SharedState,
    reporter: LogReporter,
    backup_path: PathBuf,
    shutdown: CancellationToken,
}

impl CommandDispatcher {
    pub fn new(
        state: SharedState,
        reporter: LogReporter,
        backup_path: PathBuf,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            reporter,
            backup_path,
            shutdown,
        }
    }

    /// Consume the command queue until cancellation or queue closure.
    pub async fn run(self, mut commands: mpsc::Receiver<AgentCommand>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => break,
                },
            }
        }
        info!("command dispatcher stopped");
    }

    async fn dispatch(&self, command: AgentCommand) {
        match command {
            AgentCommand::BackupNow { trigger } => self.handle_backup(trigger).await,
            AgentCommand::SyncSnapshots => self.handle_sync_snapshots().await,
            AgentCommand::Restore(request) => self.handle_restore(request).await,
            AgentCommand::Update => {
                // Reserved; the control plane may send it ahead of agent support.
                info!("update command received, self-update is not implemented");
            }
            AgentCommand::Shutdown => {
                info!("shutdown requested by control plane");
                self.shutdown.cancel();
            }
        }
    }

    async fn handle_backup(&self, trigger: BackupTrigger) {
        let Some(engine) = self.state.engine().await else {
            warn!(
                trigger = trigger.as_str(),
                "backup trigger ignored: agent not configured"
            );
            self.reporter.activity_detached(
                "warning",
                format!("{} backup trigger ignored: agent not configured", trigger.as_str()),
                None,
            );
            return;
        };

        let Some(guard) = self.state.try_begin_engine_op() else {
            warn!(
                trigger = trigger.as_str(),
                "backup already in flight, skipping trigger"
            );
            self.reporter.activity_detached(
                "warning",
                format!(
                    "{} backup trigger skipped: another backup is running",
                    trigger.as_str()
                ),
                None,
            );
            return;
        };

        let reporter = self.reporter.clone();
        let path = self.backup_path.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match engine.run_backup(&path).await {
                Ok(result) => reporter.report_backup(&result).await,
                Err(e) => {
                    error!("backup execution failed: {e}");
                    reporter
                        .report_backup(&BackupResult::failed(e.to_string(), 0.0))
                        .await;
                }
            }
        });
    }

    async fn handle_sync_snapshots(&self) {
        let Some(engine) = self.state.engine().await else {
            warn!("snapshot sync requested but agent not configured");
            self.reporter.activity_detached(
                "warning",
                "snapshot sync ignored: agent not configured".to_string(),
                None,
            );
            return;
        };

        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            match engine.list_snapshots().await {
                Ok(snapshots) => reporter.report_snapshots(snapshots).await,
                Err(e) => {
                    error!("snapshot listing failed: {e}");
                    reporter
                        .report_activity(
                            "error",
                            format!("snapshot listing failed: {e}"),
                            None,
                        )
                        .await;
                }
            }
        });
    }

    async fn handle_restore(&self, request: RestoreRequest) {
        let Some(engine) = self.state.engine().await else {
            warn!(request = %request.request_id, "restore requested but agent not configured");
            self.reporter.activity_detached(
                "warning",
                format!("restore {} ignored: agent not configured", request.request_id),
                None,
            );
            return;
        };

        // Restores share the engine slot with backups: one repository
        // operation at a time.
        let Some(guard) = self.state.try_begin_engine_op() else {
            warn!(request = %request.request_id, "engine busy, rejecting restore");
            let reporter = self.reporter.clone();
            tokio::spawn(async move {
                reporter
                    .report_restore_status(
                        &request.request_id,
                        "failed",
                        Some("another engine operation is running".to_string()),
                    )
                    .await;
            });
            return;
        };

        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let target = Path::new(&request.target_path);
            match engine.restore(&request.snapshot_id, target).await {
                Ok(()) => {
                    reporter
                        .report_restore_status(&request.request_id, "success", None)
                        .await;
                }
                Err(e) => {
                    error!(request = %request.request_id, "restore failed: {e}");
                    reporter
                        .report_restore_status(&request.request_id, "failed", Some(e.to_string()))
                        .await;
                }
            }
        });
    }
}
