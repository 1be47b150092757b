//! Shared agent state.
//!
//! Identity is written by the heartbeat loop, the engine wrapper by the
//! config reconciler, and both are read from other tasks; every access
//! goes through one lock so no task ever observes a partially-initialized
//! wrapper.

use crate::control::RemoteBackupConfig;
use crate::engine::ResticWrapper;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Identity of this agent as known to the control plane.
///
/// `agent_id` starts empty and is assigned (and possibly reassigned) by
/// heartbeat responses.
#[derive(Debug, Clone, Default)]
pub struct AgentIdentity {
    pub hostname: String,
    pub agent_id: String,
}

#[derive(Default)]
struct StateInner {
    identity: AgentIdentity,
    engine: Option<Arc<ResticWrapper>>,
    remote_config: Option<RemoteBackupConfig>,
}

/// Cloneable handle to the agent's shared mutable state.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<RwLock<StateInner>>,
    engine_gate: Arc<Mutex<()>>,
}

impl SharedState {
    pub fn new(hostname: String) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StateInner {
                identity: AgentIdentity {
                    hostname,
                    agent_id: String::new(),
                },
                engine: None,
                remote_config: None,
            })),
            engine_gate: Arc::new(Mutex::new(())),
        }
    }

    pub async fn identity(&self) -> AgentIdentity {
        self.inner.read().await.identity.clone()
    }

    /// Adopt the control plane's authoritative agent id. Returns `true`
    /// when the held identity actually changed.
    pub async fn adopt_agent_id(&self, agent_id: String) -> bool {
        if agent_id.is_empty() {
            return false;
        }
        let mut inner = self.inner.write().await;
        if inner.identity.agent_id == agent_id {
            return false;
        }
        inner.identity.agent_id = agent_id;
        true
    }

    pub async fn engine(&self) -> Option<Arc<ResticWrapper>> {
        self.inner.read().await.engine.clone()
    }

    /// Whether a configured engine wrapper is installed.
    pub async fn is_configured(&self) -> bool {
        self.inner.read().await.engine.is_some()
    }

    /// Install the engine wrapper and the configuration it was built from.
    pub async fn install_engine(&self, engine: Arc<ResticWrapper>, config: RemoteBackupConfig) {
        let mut inner = self.inner.write().await;
        inner.engine = Some(engine);
        inner.remote_config = Some(config);
    }

    /// Claim the exclusive engine-operation slot without waiting.
    ///
    /// Returns `None` while another backup or restore holds the slot; the
    /// guard releases it on drop.
    pub fn try_begin_engine_op(&self) -> Option<OwnedMutexGuard<()>> {
        self.engine_gate.clone().try_lock_owned().ok()
    }
}
