/**
 * SESSION REGISTRY - Sessions agents vivantes du processus
 *
 * FONCTIONNEMENT :
 * - Index id de session -> AgentSession
 * - track() insère puis retire la session quand son signal "fermée" part
 * - close_all() ferme toutes les sessions en parallèle (arrêt du kernel)
 */

use crate::models::SessionRecord;
use crate::session::{AgentSession, SessionState};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Vue d'une session pour l'API
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub agent_id: i64,
    pub agent_name: String,
    pub state: SessionState,
    pub record: Option<SessionRecord>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<AgentSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<AgentSession>) {
        self.sessions.write().insert(session.id().to_string(), session);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Enregistre la session jusqu'à sa fermeture complète
    pub fn track(self: &Arc<Self>, session: Arc<AgentSession>) {
        self.insert(session.clone());
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            session.closed().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove(session.id());
                debug!(session_id = %session.id(), "session unregistered");
            }
        });
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .values()
            .map(|session| SessionInfo {
                id: session.id().to_string(),
                agent_id: session.agent().id,
                agent_name: session.agent().name.clone(),
                state: session.state(),
                record: session.record(),
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<AgentSession>> = self.sessions.read().values().cloned().collect();
        join_all(sessions.iter().map(|session| session.close())).await;
        self.sessions.write().clear();
    }
}
