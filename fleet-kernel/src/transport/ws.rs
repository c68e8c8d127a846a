//! Transport WebSocket (axum) pour les connexions agents.
//!
//! Une frame texte porte un événement : `"<event>\n<payload>"`.
//! Les émissions passent par une file mpsc bornée vidée par une tâche
//! d'écriture ; une tâche de lecture dispatche les frames entrantes.
//! Le handler `disconnect` part une seule fois, et jamais après un close() local.

use super::{Event, EventHandler, HandlerTable, Transport, TransportError, EVENT_DISCONNECT};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub fn encode_frame(event: &Event) -> String {
    format!("{}\n{}", event.name, String::from_utf8_lossy(&event.payload))
}

/// Une frame sans saut de ligne est un événement sans payload
pub fn decode_frame(frame: &str) -> Option<Event> {
    let (name, payload) = frame.split_once('\n').unwrap_or((frame, ""));
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(Event::new(name, payload))
}

pub struct WsTransport {
    id: String,
    remote: SocketAddr,
    outbound: mpsc::Sender<Message>,
    handlers: Arc<RwLock<HandlerTable>>,
    inbound: Mutex<Option<SplitStream<WebSocket>>>,
    closed: AtomicBool,
    stop: CancellationToken,
}

impl WsTransport {
    pub fn new(socket: WebSocket, remote: SocketAddr, send_queue: usize) -> Self {
        let (sink, stream) = socket.split();
        let (outbound, rx) = mpsc::channel(send_queue);
        let stop = CancellationToken::new();
        let id = Uuid::new_v4().to_string();

        tokio::spawn(write_loop(id.clone(), sink, rx, stop.clone()));

        Self {
            id,
            remote,
            outbound,
            handlers: Arc::new(RwLock::new(HandlerTable::default())),
            inbound: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
            stop,
        }
    }
}

async fn write_loop(
    id: String,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        debug!(transport = %id, "websocket write failed: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!(transport = %id, "close frame not sent: {}", e);
    }
    sink.close().await.ok();
}

async fn read_loop(
    id: String,
    mut stream: SplitStream<WebSocket>,
    handlers: Arc<RwLock<HandlerTable>>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            frame = stream.next() => frame,
        };
        let event = match frame {
            Some(Ok(Message::Text(text))) => decode_frame(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => std::str::from_utf8(&bytes).ok().and_then(decode_frame),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(transport = %id, "websocket read failed: {}", e);
                break;
            }
        };
        let Some(event) = event else {
            warn!(transport = %id, "dropping malformed frame");
            continue;
        };
        if event.name == EVENT_DISCONNECT {
            break;
        }
        let name = event.name.clone();
        let table = handlers.read().clone();
        if !table.dispatch(event) {
            debug!(transport = %id, event = %name, "no handler for inbound event");
        }
    }

    // Le pair est parti : une seule notification de déconnexion
    if stop.is_cancelled() {
        return;
    }
    let table = handlers.read().clone();
    table.fire_disconnect();
}

#[async_trait]
impl Transport for WsTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }

    fn on(&self, handler: EventHandler) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.handlers.write().register(handler)
    }

    fn listen(&self) {
        let Some(stream) = self.inbound.lock().take() else { return };
        tokio::spawn(read_loop(self.id.clone(), stream, self.handlers.clone(), self.stop.clone()));
    }

    async fn emit(&self, event: Event) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(&event);
        self.outbound
            .send(Message::Text(frame.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.cancel();
        Ok(())
    }
}
