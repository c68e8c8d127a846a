/**
 * TRANSPORT - Capacité de connexion consommée par une session agent
 *
 * RÔLE :
 * Abstraction du canal bidirectionnel vers un agent : enregistrement des
 * handlers entrants, émission d'événements typés, fermeture.
 *
 * FONCTIONNEMENT :
 * - EventHandler = union typée, un variant par événement entrant (disconnect, catalog)
 * - HandlerTable = table partagée par les implémentations pour dispatcher les frames
 * - listen() n'est appelé qu'une fois les handlers posés
 * - emit() doit être sûr en appels concurrents (heartbeat, poller, push)
 */

pub mod ws;

pub use ws::WsTransport;

use async_trait::async_trait;
use std::sync::Arc;

pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_CATALOG: &str = "catalog";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_TASK_UPDATE: &str = "taskUpdate";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("handler already registered for event '{0}'")]
    DuplicateHandler(&'static str),
    #[error("send failed: {0}")]
    Send(String),
}

/// Événement échangé sur la connexion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), payload: payload.into() }
    }
}

pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;
pub type CatalogHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Clone)]
pub enum EventHandler {
    Disconnect(DisconnectHandler),
    Catalog(CatalogHandler),
}

impl EventHandler {
    pub fn event_name(&self) -> &'static str {
        match self {
            EventHandler::Disconnect(_) => EVENT_DISCONNECT,
            EventHandler::Catalog(_) => EVENT_CATALOG,
        }
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventHandler({})", self.event_name())
    }
}

/// Handlers posés sur une connexion, au plus un par événement
#[derive(Default, Clone)]
pub struct HandlerTable {
    disconnect: Option<DisconnectHandler>,
    catalog: Option<CatalogHandler>,
}

impl HandlerTable {
    pub fn register(&mut self, handler: EventHandler) -> Result<(), TransportError> {
        let name = handler.event_name();
        match handler {
            EventHandler::Disconnect(h) if self.disconnect.is_none() => self.disconnect = Some(h),
            EventHandler::Catalog(h) if self.catalog.is_none() => self.catalog = Some(h),
            _ => return Err(TransportError::DuplicateHandler(name)),
        }
        Ok(())
    }

    pub fn is_registered(&self, event: &str) -> bool {
        match event {
            EVENT_DISCONNECT => self.disconnect.is_some(),
            EVENT_CATALOG => self.catalog.is_some(),
            _ => false,
        }
    }

    /// Dispatch d'un événement entrant ; false si aucun handler ne le prend
    pub fn dispatch(&self, event: Event) -> bool {
        match event.name.as_str() {
            EVENT_DISCONNECT => self.fire_disconnect(),
            EVENT_CATALOG => match &self.catalog {
                Some(handler) => {
                    handler(event.payload);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn fire_disconnect(&self) -> bool {
        match &self.disconnect {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifiant unique de la connexion, sert d'id de session
    fn id(&self) -> &str;

    fn remote_addr(&self) -> String;

    fn on(&self, handler: EventHandler) -> Result<(), TransportError>;

    /// Commence à dispatcher les événements entrants
    fn listen(&self);

    async fn emit(&self, event: Event) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
