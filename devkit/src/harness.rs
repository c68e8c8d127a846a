/*!
Harness de session : assemble transport mock, store instrumenté et agent.
*/

use crate::fixtures;
use crate::mock_transport::MockTransport;
use crate::recording_store::RecordingStore;
use fleet_kernel::models::Agent;
use fleet_kernel::session::{AgentSession, SessionSettings};
use fleet_kernel::store::{MemoryStore, SessionStore};
use fleet_kernel::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tracing::info_span;

pub struct SessionHarness {
    pub transport: Arc<MockTransport>,
    pub store: Arc<RecordingStore>,
    pub agent: Agent,
    pub settings: SessionSettings,
}

impl Default for SessionHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHarness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            transport: Arc::new(MockTransport::new()),
            store: Arc::new(RecordingStore::new(Arc::new(MemoryStore::new()))),
            agent: fixtures::agent(1, 10),
            settings: SessionSettings {
                heartbeat_interval: Duration::from_secs(2),
                task_poll_interval: Duration::from_secs(60),
                server: "kernel-test".into(),
            },
        }
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agent = agent;
        self
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.store.inner
    }

    /// Nouvelle session sur le transport du harness (non démarrée)
    pub fn session(&self) -> Arc<AgentSession> {
        let transport: Arc<dyn Transport> = self.transport.clone();
        let store: Arc<dyn SessionStore> = self.store.clone();
        let span = info_span!("agent_session", session_id = %transport.id(), agent_id = self.agent.id);
        AgentSession::new(self.agent.clone(), 3, transport, store, self.settings.clone(), span)
    }
}

/// Logs visibles avec `RUST_LOG` pendant les tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
