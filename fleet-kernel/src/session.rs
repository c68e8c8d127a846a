/**
 * AGENT SESSION - Cycle de vie d'une connexion agent
 *
 * RÔLE :
 * Possède une connexion agent de bout en bout : enregistrement durable,
 * handlers entrants, heartbeat, push périodique des tâches, teardown.
 *
 * FONCTIONNEMENT :
 * - Starting -> Running -> Closing -> Closed
 * - start() : record en store, handlers `disconnect` + `catalog`, puis
 *   heartbeat (2s), poller de tâches (60s) et push immédiat
 * - Tout échec au démarrage ferme la session et remonte l'erreur
 * - Les erreurs en régime établi sont loggées, la session continue
 * - Teardown exécuté une seule fois (compare-and-swap), quel que soit le
 *   nombre de déclencheurs concurrents (disconnect, close())
 *
 * SIGNAUX :
 * - shutdown : demandé, débloque les activités de fond
 * - done : fermeture complète, attendable par n'importe quel observateur
 */

use crate::error::{KernelError, KernelResult};
use crate::models::{Agent, CatalogEntry, Metric, SessionRecord};
use crate::store::{SessionStore, StoreError};
use crate::transport::{
    CatalogHandler, DisconnectHandler, Event, EventHandler, Transport, TransportError, EVENT_HEARTBEAT,
    EVENT_TASK_UPDATE,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub task_poll_interval: Duration,
    /// Identité du serveur hôte, enregistrée avec la session
    pub server: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            task_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
            server: crate::config::server_hostname(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Closing,
    Closed,
}

pub struct AgentSession {
    agent: Agent,
    agent_version: i64,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    settings: SessionSettings,
    span: Span,
    state: Mutex<SessionState>,
    record: Mutex<Option<SessionRecord>>,
    started: AtomicBool,
    closing: AtomicBool,
    shutdown: CancellationToken,
    done: CancellationToken,
    activities: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentSession {
    /// Le span reçu sert de logger à la session et à toutes ses activités
    pub fn new(
        agent: Agent,
        agent_version: i64,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        settings: SessionSettings,
        span: Span,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent,
            agent_version,
            transport,
            store,
            settings,
            span,
            state: Mutex::new(SessionState::Starting),
            record: Mutex::new(None),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            activities: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        self.transport.id()
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_version(&self) -> i64 {
        self.agent_version
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn record(&self) -> Option<SessionRecord> {
        self.record.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Se résout une fois le teardown terminé
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    /// Nombre d'activités de fond encore vivantes
    pub fn running_activities(&self) -> usize {
        self.activities.lock().iter().filter(|handle| !handle.is_finished()).count()
    }

    pub async fn start(self: &Arc<Self>) -> KernelResult<()> {
        let span = self.span.clone();
        self.start_inner().instrument(span).await
    }

    async fn start_inner(self: &Arc<Self>) -> KernelResult<()> {
        if self.started.swap(true, Ordering::SeqCst) || self.state() != SessionState::Starting {
            return Err(KernelError::InvalidState(self.state()));
        }

        if let Err(e) = self.save_record().await {
            error!("unable to add agent session to store: {}", e);
            self.close().await;
            return Err(e.into());
        }

        // close() pendant l'écriture du record : le teardown ne l'a pas vu
        if self.closing.load(Ordering::SeqCst) {
            let record = self.record.lock().take();
            if let Some(record) = record {
                warn!("session closed while starting, removing its record");
                if let Err(e) = self.store.delete_session(&record.id).await {
                    error!("failed to delete session record: {}", e);
                }
            }
            return Err(KernelError::InvalidState(self.state()));
        }

        debug!("setting handler for disconnect event");
        if let Err(e) = self.transport.on(EventHandler::Disconnect(self.disconnect_handler())) {
            error!("failed to bind disconnect event: {}", e);
            self.close().await;
            return Err(e.into());
        }

        debug!("setting handler for catalog event");
        if let Err(e) = self.transport.on(EventHandler::Catalog(self.catalog_handler())) {
            error!("failed to bind catalog event handler: {}", e);
            self.close().await;
            return Err(e.into());
        }

        info!(remote = %self.transport.remote_addr(), version = self.agent_version, "starting session");
        self.transport.listen();

        let heartbeat = tokio::spawn(self.clone().heartbeat_loop().instrument(self.span.clone()));
        let poller = tokio::spawn(self.clone().task_update_loop().instrument(self.span.clone()));
        self.activities.lock().extend([heartbeat, poller]);

        {
            let mut state = self.state.lock();
            if *state == SessionState::Starting {
                *state = SessionState::Running;
            }
        }

        self.send_task_update().await;
        Ok(())
    }

    async fn save_record(&self) -> Result<(), StoreError> {
        let record = SessionRecord {
            id: self.id().to_string(),
            agent_id: self.agent.id,
            version: self.agent_version,
            remote_ip: self.transport.remote_addr(),
            server: self.settings.server.clone(),
            created: OffsetDateTime::now_utc(),
        };
        self.store.add_session(&record).await?;
        *self.record.lock() = Some(record);
        Ok(())
    }

    /// Ferme la session ; les appels suivants ne font rien
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown().instrument(self.span.clone()).await
    }

    async fn teardown(&self) {
        *self.state.lock() = SessionState::Closing;
        self.shutdown.cancel();

        if let Err(e) = self.transport.close().await {
            warn!("failed to close transport: {}", e);
        }

        let record = self.record.lock().take();
        if let Some(record) = record {
            if let Err(e) = self.store.delete_session(&record.id).await {
                error!("failed to delete session record: {}", e);
            }
        }

        *self.state.lock() = SessionState::Closed;
        info!("session closed");
        self.done.cancel();
    }

    fn disconnect_handler(self: &Arc<Self>) -> DisconnectHandler {
        let session = Arc::downgrade(self);
        Arc::new(move || {
            let Some(session) = session.upgrade() else { return };
            debug!(parent: &session.span, "session has disconnected");
            tokio::spawn(async move { session.close().await });
        })
    }

    fn catalog_handler(self: &Arc<Self>) -> CatalogHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |body: Vec<u8>| {
            let Some(session) = session.upgrade() else { return };
            let span = session.span.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = session.ingest_catalog(&body).await {
                        error!("catalog dropped: {}", e);
                    }
                }
                .instrument(span),
            );
        })
    }

    /// Upsert des métriques manquantes à partir d'un catalogue agent
    pub async fn ingest_catalog(&self, body: &[u8]) -> KernelResult<usize> {
        let catalog: Vec<CatalogEntry> = serde_json::from_slice(body)?;
        debug!(entries = catalog.len(), "received catalog");

        let metrics: Vec<Metric> = catalog
            .into_iter()
            .map(|entry| Metric::from_catalog(&self.agent, entry))
            .collect();
        let added = self.store.add_missing_metrics(metrics).await?;
        if added > 0 {
            info!(added, "registered new metrics from catalog");
        }
        Ok(added)
    }

    async fn emit(&self, event: Event) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.transport.emit(event).await
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = self.settings.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("session ended, stopping heartbeat");
                    return;
                }
                _ = ticker.tick() => {
                    let now = OffsetDateTime::now_utc();
                    let stamp = now.format(&Rfc3339).unwrap_or_else(|_| now.to_string());
                    if let Err(e) = self.emit(Event::new(EVENT_HEARTBEAT, stamp)).await {
                        warn!("failed to emit heartbeat event: {}", e);
                    }
                }
            }
        }
    }

    async fn task_update_loop(self: Arc<Self>) {
        let period = self.settings.task_poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("session ended, stopping task updates");
                    return;
                }
                _ = ticker.tick() => self.send_task_update().await,
            }
        }
    }

    async fn send_task_update(&self) {
        debug!("sending task update");
        let tasks = match self.store.get_agent_tasks(&self.agent).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("failed to get task list: {}", e);
                return;
            }
        };
        let body = match serde_json::to_vec(&tasks) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to serialize task list: {}", e);
                return;
            }
        };
        if let Err(e) = self.emit(Event::new(EVENT_TASK_UPDATE, body)).await {
            warn!("failed to emit taskUpdate event: {}", e);
        }
    }
}
