/**
 * MEMORY STORE - Stockage en mémoire des agents, tâches, métriques et sessions
 *
 * FONCTIONNEMENT :
 * - État complet derrière un RwLock parking_lot (verrous courts, jamais à travers un await)
 * - Snapshot JSON optionnel des agents, tâches et métriques à chaque écriture
 * - Écritures sérialisées ; un snapshot en échec annule la modification en mémoire
 * - Les sessions ne sont jamais sauvegardées : elles n'ont de sens que pour une connexion vivante
 * - Les routes sont persistées sous leur forme encodée et redécodées au chargement
 */

use super::{SessionStore, StoreError};
use crate::models::{Agent, Metric, NewTask, SessionRecord, Task, TaskConfig, TaskDto, TaskQuery, TASK_ORDER_FIELDS};
use crate::routes::TaskRoute;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use time::OffsetDateTime;

type MetricKey = (i64, String, i64);

#[derive(Default)]
struct StoreState {
    agents: BTreeMap<i64, Agent>,
    tasks: BTreeMap<i64, Task>,
    metrics: BTreeMap<MetricKey, Metric>,
    sessions: HashMap<String, SessionRecord>,
    next_task_id: i64,
}

/// Ligne de tâche persistée ; la route est stockée encodée
#[derive(Debug, Serialize, Deserialize)]
struct TaskRow {
    id: i64,
    name: String,
    org_id: i64,
    config: TaskConfig,
    interval: i64,
    route: String,
    enabled: bool,
    metrics: BTreeMap<String, i64>,
    #[serde(with = "time::serde::rfc3339")]
    created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    updated: OffsetDateTime,
}

impl TaskRow {
    fn from_task(task: &Task) -> Result<Self, StoreError> {
        let route = String::from_utf8_lossy(&task.route.encode()?).into_owned();
        Ok(Self {
            id: task.id,
            name: task.name.clone(),
            org_id: task.org_id,
            config: task.config.clone(),
            interval: task.interval,
            route,
            enabled: task.enabled,
            metrics: task.metrics.clone(),
            created: task.created,
            updated: task.updated,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        Ok(Task {
            id: self.id,
            name: self.name,
            org_id: self.org_id,
            config: self.config,
            interval: self.interval,
            route: TaskRoute::decode(self.route.as_bytes())?,
            enabled: self.enabled,
            metrics: self.metrics,
            created: self.created,
            updated: self.updated,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    agents: Vec<Agent>,
    tasks: Vec<TaskRow>,
    metrics: Vec<Metric>,
}

pub struct MemoryStore {
    state: RwLock<StoreState>,
    data_file: Option<PathBuf>,
    // un seul écrivain à la fois : mutation + snapshot + éventuel rollback
    writer: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store purement en mémoire, rien n'est écrit sur disque
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState { next_task_id: 1, ..Default::default() }),
            data_file: None,
            writer: Mutex::new(()),
        }
    }

    /// Store adossé à un snapshot JSON, chargé s'il existe
    pub fn open<P: Into<PathBuf>>(data_file: P) -> Result<Self, StoreError> {
        let path = data_file.into();
        let mut store = Self::new();
        store.data_file = Some(path.clone());

        if !path.exists() {
            store.persist()?;
            tracing::info!(path = %path.display(), "no existing snapshot, starting fresh");
            return Ok(store);
        }

        let content = fs::read_to_string(&path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        {
            let mut state = store.state.write();
            for agent in snapshot.agents {
                state.agents.insert(agent.id, agent);
            }
            for row in snapshot.tasks {
                let task = row.into_task()?;
                state.next_task_id = state.next_task_id.max(task.id + 1);
                state.tasks.insert(task.id, task);
            }
            for metric in snapshot.metrics {
                state.metrics.insert(metric.key(), metric);
            }
            tracing::info!(
                agents = state.agents.len(),
                tasks = state.tasks.len(),
                metrics = state.metrics.len(),
                path = %path.display(),
                "loaded store snapshot"
            );
        }
        Ok(store)
    }

    /// Écrit le snapshot courant (fichier temporaire puis rename).
    /// L'appelant tient `writer`.
    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else { return Ok(()) };

        let snapshot = {
            let state = self.state.read();
            Snapshot {
                agents: state.agents.values().cloned().collect(),
                tasks: state.tasks.values().map(TaskRow::from_task).collect::<Result<_, _>>()?,
                metrics: state.metrics.values().cloned().collect(),
            }
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        if let Err(e) = fs::rename(&tmp, path) {
            fs::remove_file(&tmp).ok();
            return Err(e.into());
        }
        Ok(())
    }

    fn persist_or_rollback(&self, rollback: impl FnOnce(&mut StoreState)) -> Result<(), StoreError> {
        if let Err(e) = self.persist() {
            tracing::error!("snapshot write failed, reverting change: {}", e);
            rollback(&mut self.state.write());
            return Err(e);
        }
        Ok(())
    }

    pub fn add_agent(&self, agent: Agent) -> Result<(), StoreError> {
        let _writer = self.writer.lock();
        let id = agent.id;
        let previous = self.state.write().agents.insert(id, agent);
        self.persist_or_rollback(|state| match previous {
            Some(previous) => {
                state.agents.insert(id, previous);
            }
            None => {
                state.agents.remove(&id);
            }
        })
    }

    pub fn get_agent(&self, id: i64) -> Option<Agent> {
        self.state.read().agents.get(&id).cloned()
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.state.read().agents.values().cloned().collect()
    }

    /// Crée une tâche ; une route invalide est refusée avant toute écriture
    pub fn add_task(&self, new_task: NewTask) -> Result<Task, StoreError> {
        new_task.route.validate()?;

        let _writer = self.writer.lock();
        let now = OffsetDateTime::now_utc();
        let task = {
            let mut state = self.state.write();
            let id = state.next_task_id;
            state.next_task_id += 1;
            let task = Task {
                id,
                name: new_task.name,
                org_id: new_task.org_id,
                config: new_task.config,
                interval: new_task.interval,
                route: new_task.route,
                enabled: new_task.enabled,
                metrics: new_task.metrics,
                created: now,
                updated: now,
            };
            state.tasks.insert(id, task.clone());
            task
        };
        self.persist_or_rollback(|state| {
            state.tasks.remove(&task.id);
        })?;
        Ok(task)
    }

    pub fn update_task(&self, id: i64, new_task: NewTask) -> Result<Task, StoreError> {
        new_task.route.validate()?;

        let _writer = self.writer.lock();
        let (previous, task) = {
            let mut state = self.state.write();
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
            let previous = task.clone();
            task.name = new_task.name;
            task.org_id = new_task.org_id;
            task.config = new_task.config;
            task.interval = new_task.interval;
            task.route = new_task.route;
            task.enabled = new_task.enabled;
            task.metrics = new_task.metrics;
            task.updated = OffsetDateTime::now_utc();
            (previous, task.clone())
        };
        self.persist_or_rollback(|state| {
            state.tasks.insert(id, previous);
        })?;
        Ok(task)
    }

    pub fn get_task(&self, id: i64) -> Option<Task> {
        self.state.read().tasks.get(&id).cloned()
    }

    /// Tâches filtrées, triées puis paginées
    pub fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskDto>, StoreError> {
        let order = query.order_by.as_deref().unwrap_or("id");
        if !TASK_ORDER_FIELDS.contains(&order) {
            return Err(StoreError::InvalidQuery(format!("unsupported orderBy '{order}'")));
        }

        let state = self.state.read();
        let mut tasks: Vec<&Task> = state.tasks.values().filter(|task| query.matches(task)).collect();
        match order {
            "name" => tasks.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id))),
            "interval" => tasks.sort_by_key(|task| (task.interval, task.id)),
            "created" => tasks.sort_by_key(|task| (task.created, task.id)),
            "updated" => tasks.sort_by_key(|task| (task.updated, task.id)),
            _ => {}
        }

        let (offset, limit) = query.window();
        Ok(tasks.into_iter().skip(offset).take(limit).map(TaskDto::from).collect())
    }

    pub fn task_count(&self) -> usize {
        self.state.read().tasks.len()
    }

    /// Métriques visibles par un propriétaire : les siennes et les publiques
    pub fn list_metrics(&self, owner: i64) -> Vec<Metric> {
        self.state
            .read()
            .metrics
            .values()
            .filter(|metric| metric.owner == owner || metric.public)
            .cloned()
            .collect()
    }

    pub fn metric_count(&self) -> usize {
        self.state.read().metrics.len()
    }

    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self.state.read().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created.cmp(&b.created));
        sessions
    }

    fn insert_missing_metrics(&self, metrics: Vec<Metric>) -> Result<usize, StoreError> {
        let _writer = self.writer.lock();
        let added: Vec<MetricKey> = {
            let mut state = self.state.write();
            let mut added = Vec::new();
            for metric in metrics {
                if let Entry::Vacant(slot) = state.metrics.entry(metric.key()) {
                    added.push(slot.key().clone());
                    slot.insert(metric);
                }
            }
            added
        };
        if !added.is_empty() {
            self.persist_or_rollback(|state| {
                for key in &added {
                    state.metrics.remove(key);
                }
            })?;
        }
        Ok(added.len())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn add_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.sessions.contains_key(&record.id) {
            return Err(StoreError::Duplicate(format!("session {}", record.id)));
        }
        state.sessions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.state
            .write()
            .sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    async fn get_agent_tasks(&self, agent: &Agent) -> Result<Vec<TaskDto>, StoreError> {
        let state = self.state.read();
        Ok(state
            .tasks
            .values()
            .filter(|task| task.enabled && task.route.matches(agent))
            .map(TaskDto::from)
            .collect())
    }

    async fn add_missing_metrics(&self, metrics: Vec<Metric>) -> Result<usize, StoreError> {
        self.insert_missing_metrics(metrics)
    }
}
