/*!
Transport en mémoire pour tester une session sans socket.

Enregistre toutes les émissions, compte les fermetures et permet de
simuler les événements entrants (catalog, disconnect).
*/

use async_trait::async_trait;
use fleet_kernel::transport::{Event, EventHandler, HandlerTable, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

pub struct MockTransport {
    id: String,
    remote: String,
    handlers: RwLock<HandlerTable>,
    emitted: Mutex<Vec<Event>>,
    listening: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    fail_emits: AtomicBool,
    refuse_handler: Mutex<Option<&'static str>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote: "192.0.2.10:51234".into(),
            handlers: RwLock::new(HandlerTable::default()),
            emitted: Mutex::new(Vec::new()),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            fail_emits: AtomicBool::new(false),
            refuse_handler: Mutex::new(None),
        }
    }

    /// Toute émission échoue tant que le flag est levé
    pub fn set_fail_emits(&self, fail: bool) {
        self.fail_emits.store(fail, Ordering::SeqCst);
    }

    /// Refuse l'enregistrement du handler de cet événement
    pub fn refuse_handler(&self, event: &'static str) {
        *self.refuse_handler.lock() = Some(event);
    }

    /// Simule une frame entrante ; false si rien ne l'a prise
    pub fn simulate_incoming(&self, event: &str, payload: impl Into<Vec<u8>>) -> bool {
        if !self.listening.load(Ordering::SeqCst) {
            return false;
        }
        let table = self.handlers.read().clone();
        table.dispatch(Event::new(event, payload))
    }

    /// Simule le départ du pair
    pub fn simulate_disconnect(&self) -> bool {
        let table = self.handlers.read().clone();
        table.fire_disconnect()
    }

    pub fn emitted(&self) -> Vec<Event> {
        self.emitted.lock().clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<Event> {
        self.emitted.lock().iter().filter(|e| e.name == name).cloned().collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.emitted.lock().iter().filter(|e| e.name == name).count()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn has_handler(&self, event: &str) -> bool {
        self.handlers.read().is_registered(event)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    fn on(&self, handler: EventHandler) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if *self.refuse_handler.lock() == Some(handler.event_name()) {
            return Err(TransportError::Send(format!("refused handler for {}", handler.event_name())));
        }
        self.handlers.write().register(handler)
    }

    fn listen(&self) {
        self.listening.store(true, Ordering::SeqCst);
    }

    async fn emit(&self, event: Event) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.fail_emits.load(Ordering::SeqCst) {
            return Err(TransportError::Send("injected emit failure".into()));
        }
        tracing::debug!(event = %event.name, bytes = event.payload.len(), "[MOCK] emitted");
        self.emitted.lock().push(event);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.listening.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_kernel::transport::EVENT_HEARTBEAT;

    #[tokio::test]
    async fn test_emit_after_close_is_refused() {
        let transport = MockTransport::new();
        transport.emit(Event::new(EVENT_HEARTBEAT, "t1")).await.unwrap();
        transport.close().await.unwrap();

        assert!(matches!(
            transport.emit(Event::new(EVENT_HEARTBEAT, "t2")).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(transport.count(EVENT_HEARTBEAT), 1);
        assert_eq!(transport.close_calls(), 1);
    }

    #[test]
    fn test_incoming_requires_listen() {
        let transport = MockTransport::new();
        transport
            .on(EventHandler::Catalog(std::sync::Arc::new(|_: Vec<u8>| {})))
            .unwrap();
        assert!(!transport.simulate_incoming("catalog", "[]"));
        transport.listen();
        assert!(transport.simulate_incoming("catalog", "[]"));
    }
}
