//! Agent runtime coordination.
//!
//! Owns the shared state and wires the concurrent loops together: config
//! reconciliation, heartbeat reporting, command dispatch, and the local
//! backup schedule. All loops stop on the shared cancellation token.

pub mod commands;
pub mod scheduler;
pub mod state;

use crate::agent::commands::{AgentCommand, BackupTrigger, CommandDispatcher};
use crate::agent::scheduler::BackupScheduler;
use crate::agent::state::SharedState;
use crate::config::Config;
use crate::control::heartbeat::HeartbeatReporter;
use crate::control::reconciler::ConfigReconciler;
use crate::control::reporter::LogReporter;
use crate::control::ApiClient;
use crate::utils::errors::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Depth of the inbound command queue. Commands arrive one per heartbeat
/// tick, so this never fills in practice.
const COMMAND_QUEUE_DEPTH: usize = 16;

pub struct Agent {
    config: Arc<Config>,
    state: SharedState,
    client: Arc<ApiClient>,
    reporter: LogReporter,
    hostname: String,
}

impl Agent {
    pub fn new(config: Config) -> Result<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let state = SharedState::new(hostname.clone());
        let client = Arc::new(ApiClient::new(&config.api)?);
        let reporter = LogReporter::new(client.clone(), state.clone());

        Ok(Self {
            config: Arc::new(config),
            state,
            client,
            reporter,
            hostname,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Run every agent loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();

        let reconciler = ConfigReconciler::new(
            self.client.clone(),
            self.state.clone(),
            self.reporter.clone(),
            self.config.clone(),
            ready_tx,
        );
        let reconciler_handle = tokio::spawn(reconciler.run(shutdown.clone()));

        let heartbeat = HeartbeatReporter::new(
            self.client.clone(),
            self.state.clone(),
            command_tx.clone(),
            Duration::from_secs(self.config.api.heartbeat_interval_secs),
        );
        let heartbeat_handle = tokio::spawn(heartbeat.run(shutdown.clone()));

        let dispatcher = CommandDispatcher::new(
            self.state.clone(),
            self.reporter.clone(),
            self.config.backup.path.clone(),
            shutdown.clone(),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run(command_rx, shutdown.clone()));

        // A broken cron expression costs the local schedule, not the agent.
        let scheduler =
            match BackupScheduler::start(&self.config.backup.schedule, command_tx.clone()).await {
                Ok(scheduler) => Some(scheduler),
                Err(e) => {
                    warn!("backup schedule disabled: {e}");
                    None
                }
            };

        // The first successful configuration triggers one immediate backup.
        let initial_tx = command_tx.clone();
        let initial_backup = tokio::spawn(async move {
            if ready_rx.await.is_ok() {
                let _ = initial_tx
                    .send(AgentCommand::BackupNow {
                        trigger: BackupTrigger::Initial,
                    })
                    .await;
            }
        });

        shutdown.cancelled().await;
        info!("shutting down agent tasks");

        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        initial_backup.abort();

        let tasks = [
            ("reconciler", reconciler_handle),
            ("heartbeat", heartbeat_handle),
            ("dispatcher", dispatcher_handle),
        ];
        for (name, handle) in tasks {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => debug!("{name} task stopped"),
                Ok(Err(e)) => error!("{name} task panicked: {e}"),
                Err(_) => warn!("{name} task did not stop in time"),
            }
        }

        Ok(())
    }
}
