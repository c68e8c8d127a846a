/**
 * API REST FLEET - Serveur HTTP et point d'entrée WebSocket des agents
 *
 * RÔLE :
 * Administration des agents et tâches, inspection des sessions et
 * métriques, et upgrade WebSocket qui ouvre une session agent.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes : /health, /system/health, /agents, /sessions, /tasks, /metrics, /socket
 * - Une route de tâche invalide est refusée en 400, rien n'est persisté
 * - /socket?agent_id=..&version=.. : agent inconnu -> 404, sinon session démarrée
 * - /tasks et /metrics sont cloisonnés par organisation (header x-org-id)
 * - GET /tasks : filtres name, metric, metricVersion, enabled ; orderBy, limit, page
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Sans clé configurée, toute l'API est refusée
 */

use crate::config::KernelConfig;
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{Agent, Metric, NewTask, TaskConfig, TaskDto, TaskQuery};
use crate::registry::{SessionInfo, SessionRegistry};
use crate::routes::TaskRoute;
use crate::session::{AgentSession, SessionSettings};
use crate::store::{MemoryStore, SessionStore, StoreError};
use crate::transport::{Transport, WsTransport};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info_span, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<SessionRegistry>,
    pub health_tracker: HealthTracker,
    pub session_settings: SessionSettings,
    pub api_key: Option<String>,
    pub send_queue: usize,
}

impl AppState {
    pub fn new(config: &KernelConfig, store: Arc<MemoryStore>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            store,
            registry,
            health_tracker: HealthTracker::new(),
            session_settings: config.session_settings(),
            api_key: config.api_key(),
            send_queue: config.server.send_queue.max(1),
        }
    }
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(code: StatusCode, msg: impl std::fmt::Display) -> ApiError {
    (code, Json(json!({ "ok": false, "msg": msg.to_string() })))
}

fn store_error(e: StoreError) -> ApiError {
    let code = match &e {
        StoreError::Route(_) | StoreError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Duplicate(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(code, e)
}

/// Organisation de l'appelant, obligatoire sur les routes cloisonnées
fn org_scope(headers: &HeaderMap) -> Result<i64, ApiError> {
    headers
        .get("x-org-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing or invalid x-org-id header"))
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        warn!("SECURITY: FLEET_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request with missing or wrong api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/agents", get(list_agents).post(create_agent))
        .route("/sessions", get(list_sessions))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", put(update_task))
        .route("/metrics", get(list_metrics))
        .route("/socket", get(agent_socket))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.store, &app.registry))
}

#[derive(Debug, Deserialize)]
struct AgentRequest {
    id: i64,
    name: String,
    owner: i64,
    #[serde(default)]
    public: bool,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_version")]
    version: i64,
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> i64 {
    1
}

// GET /agents
async fn list_agents(State(app): State<AppState>) -> Json<Vec<Agent>> {
    Json(app.store.list_agents())
}

// POST /agents (création ou remplacement)
async fn create_agent(
    State(app): State<AppState>,
    Json(req): Json<AgentRequest>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    let created = app
        .store
        .get_agent(req.id)
        .map(|existing| existing.created)
        .unwrap_or_else(OffsetDateTime::now_utc);
    let mut agent = Agent::new(req.id, req.name, req.owner);
    agent.public = req.public;
    agent.enabled = req.enabled;
    agent.tags = req.tags;
    agent.version = req.version;
    agent.created = created;

    app.store.add_agent(agent.clone()).map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(agent)))
}

// GET /sessions
async fn list_sessions(State(app): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(app.registry.list())
}

/// Corps de création/mise à jour ; la route reste brute pour remonter ses erreurs en 400
#[derive(Debug, Deserialize)]
struct TaskRequest {
    name: String,
    #[serde(default)]
    config: TaskConfig,
    interval: i64,
    route: Value,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    metrics: BTreeMap<String, i64>,
}

impl TaskRequest {
    fn into_new_task(self, org_id: i64) -> Result<NewTask, ApiError> {
        let route = TaskRoute::from_value(self.route).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
        route.validate().map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
        Ok(NewTask {
            name: self.name,
            org_id,
            config: self.config,
            interval: self.interval,
            route,
            enabled: self.enabled,
            metrics: self.metrics,
        })
    }
}

// GET /tasks?name=..&metric=..&metricVersion=..&enabled=..&orderBy=..&limit=..&page=..
async fn list_tasks(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(mut query): Query<TaskQuery>,
) -> Result<Json<Vec<TaskDto>>, ApiError> {
    query.org_id = Some(org_scope(&headers)?);
    let tasks = app.store.list_tasks(&query).map_err(store_error)?;
    Ok(Json(tasks))
}

// POST /tasks
async fn create_task(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TaskRequest>,
) -> Result<(StatusCode, Json<TaskDto>), ApiError> {
    let org_id = org_scope(&headers)?;
    let task = app.store.add_task(req.into_new_task(org_id)?).map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(TaskDto::from(&task))))
}

// PUT /tasks/{id} ; la tâche d'une autre organisation n'existe pas pour l'appelant
async fn update_task(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<TaskRequest>,
) -> Result<Json<TaskDto>, ApiError> {
    let org_id = org_scope(&headers)?;
    if !app.store.get_task(id).is_some_and(|task| task.org_id == org_id) {
        return Err(store_error(StoreError::NotFound(format!("task {id}"))));
    }
    let task = app.store.update_task(id, req.into_new_task(org_id)?).map_err(store_error)?;
    Ok(Json(TaskDto::from(&task)))
}

// GET /metrics (métriques de l'organisation et métriques publiques)
async fn list_metrics(State(app): State<AppState>, headers: HeaderMap) -> Result<Json<Vec<Metric>>, ApiError> {
    let org_id = org_scope(&headers)?;
    Ok(Json(app.store.list_metrics(org_id)))
}

#[derive(Debug, Deserialize)]
struct SocketParams {
    agent_id: i64,
    version: Option<i64>,
}

// GET /socket?agent_id=..&version=..
async fn agent_socket(
    State(app): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<SocketParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(agent) = app.store.get_agent(params.agent_id) else {
        return api_error(StatusCode::NOT_FOUND, format!("agent {} not found", params.agent_id)).into_response();
    };
    if !agent.enabled {
        return api_error(StatusCode::FORBIDDEN, format!("agent {} is disabled", agent.id)).into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let version = params.version.unwrap_or(agent.version);
    ws.on_upgrade(move |socket| run_agent_session(app, socket, remote, agent, version))
}

async fn run_agent_session(app: AppState, socket: WebSocket, remote: SocketAddr, agent: Agent, version: i64) {
    let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(socket, remote, app.send_queue));
    let store: Arc<dyn SessionStore> = app.store.clone();
    let span = info_span!("agent_session", session_id = %transport.id(), agent_id = agent.id);

    let session = AgentSession::new(agent, version, transport, store, app.session_settings.clone(), span);
    if let Err(e) = session.start().await {
        error!(session_id = %session.id(), "failed to start agent session: {}", e);
        return;
    }
    app.registry.track(session);
}
