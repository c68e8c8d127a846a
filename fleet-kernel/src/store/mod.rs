/**
 * SESSION STORE - Interface de persistance vue par les sessions agents
 *
 * RÔLE :
 * Contrat étroit entre une session agent et le stockage : enregistrement
 * de la session, liste des tâches de l'agent, upsert du catalogue.
 *
 * FONCTIONNEMENT :
 * - SessionStore trait = les quatre opérations utilisées par une session
 * - Chaque opération est atomique côté store, aucune transaction longue
 * - MemoryStore = implémentation en mémoire avec snapshot JSON optionnel
 */

pub mod memory;

pub use memory::MemoryStore;

use crate::models::{Agent, Metric, SessionRecord, TaskDto};
use crate::routes::RouteError;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Duplicate(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid route: {0}")]
    Route(#[from] RouteError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn add_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;

    /// Tâches actives dont la route cible l'agent
    async fn get_agent_tasks(&self, agent: &Agent) -> Result<Vec<TaskDto>, StoreError>;

    /// Insère uniquement les métriques absentes pour (owner, namespace, version).
    /// Retourne le nombre de métriques ajoutées.
    async fn add_missing_metrics(&self, metrics: Vec<Metric>) -> Result<usize, StoreError>;
}
