//! Local cron schedule for unattended backups.
//!
//! The schedule only enqueues a trigger; the dispatcher applies the same
//! configured-engine check and busy-guard as a remotely-triggered backup.

use crate::agent::commands::{AgentCommand, BackupTrigger};
use crate::utils::errors::{AgentError, Result};
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub struct BackupScheduler {
    scheduler: JobScheduler,
}

impl BackupScheduler {
    /// Register and start the cron job for `schedule`.
    pub async fn start(schedule: &str, commands: mpsc::Sender<AgentCommand>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AgentError::Scheduler(e.to_string()))?;

        let job = Job::new_async(schedule, move |_uuid, _lock| {
            let commands = commands.clone();
            Box::pin(async move {
                info!("scheduled backup trigger fired");
                if let Err(e) = commands.try_send(AgentCommand::BackupNow {
                    trigger: BackupTrigger::Scheduled,
                }) {
                    warn!("scheduled backup trigger dropped: {e}");
                }
            })
        })
        .map_err(|e| AgentError::Scheduler(e.to_string()))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| AgentError::Scheduler(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| AgentError::Scheduler(e.to_string()))?;

        info!(cron = %schedule, "backup schedule registered");
        Ok(Self { scheduler })
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("scheduler shutdown failed: {e}");
        }
    }
}
