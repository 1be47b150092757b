//! Remote configuration reconciliation.
//!
//! Polls the control plane until it hands out a complete backup
//! configuration, then builds the engine wrapper, makes sure the
//! repository exists, and signals readiness exactly once. Once configured,
//! later ticks are no-ops: the agent never re-fetches or re-initializes
//! until it is restarted.

use crate::agent::state::SharedState;
use crate::config::Config;
use crate::control::reporter::LogReporter;
use crate::control::{ApiClient, RemoteBackupConfig};
use crate::engine::{EngineError, RepositoryConfig, ResticWrapper};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct ConfigReconciler {
    client: Arc<ApiClient>,
    state: SharedState,
    reporter: LogReporter,
    local: Arc<Config>,
    readiness: Option<oneshot::Sender<()>>,
    interval: Duration,
}

impl ConfigReconciler {
    pub fn new(
        client: Arc<ApiClient>,
        state: SharedState,
        reporter: LogReporter,
        local: Arc<Config>,
        readiness: oneshot::Sender<()>,
    ) -> Self {
        let interval = Duration::from_secs(local.api.config_poll_interval_secs);
        Self {
            client,
            state,
            reporter,
            local,
            readiness: Some(readiness),
            interval,
        }
    }

    /// Run the reconciliation loop; the first attempt fires immediately.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Ready: hold the configuration until restart.
                    if self.state.is_configured().await {
                        continue;
                    }
                    self.tick().await;
                }
            }
        }
        info!("config reconciliation loop stopped");
    }

    async fn tick(&mut self) {
        let response = match self.client.fetch_config().await {
            Ok(response) => response,
            Err(e) => {
                warn!("config fetch failed, retrying next tick: {e}");
                return;
            }
        };

        if !response.success || !response.configured {
            debug!(
                "backup configuration pending on control plane: {}",
                response.message.as_deref().unwrap_or("not yet configured")
            );
            return;
        }

        let Some(remote) = RemoteBackupConfig::from_response(&response, &self.local.s3) else {
            warn!("control plane reports configured but credentials are incomplete");
            return;
        };

        let hostname = self.state.identity().await.hostname;
        let repo = RepositoryConfig {
            endpoint: remote.endpoint.clone(),
            bucket: remote.bucket.clone(),
            path: hostname,
            region: remote.region.clone(),
            access_key: remote.access_key.clone(),
            secret_key: remote.secret_key.clone(),
            password: remote.repo_password.clone(),
        };

        let timeout = Duration::from_secs(self.local.engine.operation_timeout_secs);
        let wrapper =
            match ResticWrapper::new(self.local.engine.path.clone(), repo, timeout).await {
                Ok(wrapper) => wrapper,
                Err(EngineError::EngineNotFound(path)) => {
                    // Re-probed on the next successful config fetch, so
                    // installing the engine later recovers without restart.
                    warn!(path = %path.display(), "backup engine not installed");
                    return;
                }
                Err(e) => {
                    warn!("engine probe failed: {e}");
                    return;
                }
            };

        if let Err(e) = wrapper.ensure_repository().await {
            error!("repository initialization failed: {e}");
            self.reporter
                .activity_detached(
                    "error",
                    format!("repository initialization failed: {e}"),
                    None,
                );
            return;
        }

        self.state.install_engine(Arc::new(wrapper), remote).await;
        info!("backup engine configured, repository ready");

        if let Some(readiness) = self.readiness.take() {
            let _ = readiness.send(());
        }
    }
}
