/**
 * FLEET KERNEL - Plan de contrôle des agents de collecte
 *
 * RÔLE :
 * Modèle de routage des tâches, sessions agents (heartbeat, push des tâches,
 * ingestion du catalogue), stockage, transport WebSocket et API REST.
 */

pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod models;
pub mod registry;
pub mod routes;
pub mod session;
pub mod store;
pub mod transport;

pub use error::{KernelError, KernelResult};
pub use registry::SessionRegistry;
pub use routes::{RouteError, RouteType, TaskRoute};
pub use session::{AgentSession, SessionSettings, SessionState};
pub use store::{MemoryStore, SessionStore, StoreError};
pub use transport::{Event, EventHandler, Transport, TransportError};
