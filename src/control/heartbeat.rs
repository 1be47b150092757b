//! Periodic liveness reporting.
//!
//! Each tick posts the agent's status to the control plane. The response
//! doubles as the inbound command channel: the next remote command and the
//! authoritative agent id ride back on it. There is no retry within a
//! tick; the next tick is the retry.

use crate::agent::commands::AgentCommand;
use crate::agent::state::SharedState;
use crate::control::{ApiClient, HeartbeatRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct HeartbeatReporter {
    client: Arc<ApiClient>,
    state: SharedState,
    commands: mpsc::Sender<AgentCommand>,
    interval: Duration,
}

impl HeartbeatReporter {
    pub fn new(
        client: Arc<ApiClient>,
        state: SharedState,
        commands: mpsc::Sender<AgentCommand>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            state,
            commands,
            interval,
        }
    }

    /// Run the heartbeat loop; the first tick fires immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("heartbeat loop stopped");
    }

    async fn tick(&self) {
        let identity = self.state.identity().await;
        let payload = HeartbeatRequest {
            hostname: identity.hostname,
            status: "online".to_string(),
            ip_address: None,
        };

        let response = match self.client.send_heartbeat(&payload).await {
            Ok(response) => response,
            Err(e) => {
                warn!("heartbeat delivery failed, retrying next tick: {e}");
                return;
            }
        };

        if !response.success {
            warn!(
                "control plane rejected heartbeat: {}",
                response.message.as_deref().unwrap_or("no message")
            );
            return;
        }

        if let Some(agent_id) = response.agent_id.clone() {
            if self.state.adopt_agent_id(agent_id.clone()).await {
                info!(agent_id = %agent_id, "adopted agent identity from control plane");
            }
        }

        match AgentCommand::from_heartbeat(&response) {
            None => debug!("heartbeat delivered, nothing to do"),
            Some(command) => {
                debug!(?command, "queueing remote command");
                if let Err(e) = self.commands.try_send(command) {
                    warn!("command queue full, dropping remote command: {e}");
                }
            }
        }
    }
}
