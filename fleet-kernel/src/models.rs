use crate::routes::TaskRoute;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Collecteur distant, immuable pendant la durée d'une session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub owner: i64,
    pub public: bool,
    pub enabled: bool,
    pub tags: Vec<String>,
    /// Version de protocole déclarée, utilisée si la connexion n'en négocie pas
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

impl Agent {
    pub fn new(id: i64, name: impl Into<String>, owner: i64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            name: name.into(),
            owner,
            public: false,
            enabled: true,
            tags: Vec::new(),
            version: 1,
            created: now,
            updated: now,
        }
    }
}

/// Enregistrement durable d'une connexion ouverte
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub agent_id: i64,
    pub version: i64,
    pub remote_ip: String,
    pub server: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

/// Règle de collecte acceptée par une métrique
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

/// Entrée du catalogue envoyé par un agent (événement `catalog`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub namespace: String,
    pub version: i64,
    #[serde(default)]
    pub policy: Vec<PolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub owner: i64,
    pub public: bool,
    pub namespace: String,
    pub version: i64,
    pub policy: Vec<PolicyRule>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

impl Metric {
    /// La métrique hérite du propriétaire et de la visibilité de l'agent
    pub fn from_catalog(agent: &Agent, entry: CatalogEntry) -> Self {
        Self {
            owner: agent.owner,
            public: agent.public,
            namespace: entry.namespace,
            version: entry.version,
            policy: entry.policy,
            created: OffsetDateTime::now_utc(),
        }
    }

    /// Clé d'unicité (owner, namespace, version)
    pub fn key(&self) -> (i64, String, i64) {
        (self.owner, self.namespace.clone(), self.version)
    }
}

/// plugin -> option -> valeur
pub type TaskConfig = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub org_id: i64,
    pub config: TaskConfig,
    pub interval: i64,
    pub route: TaskRoute,
    pub enabled: bool,
    pub metrics: BTreeMap<String, i64>,
    pub created: OffsetDateTime,
    pub updated: OffsetDateTime,
}

/// Vue d'une tâche envoyée aux agents et à l'API (org_id non exposé)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDto {
    pub id: i64,
    pub name: String,
    pub config: TaskConfig,
    pub interval: i64,
    pub route: TaskRoute,
    pub metrics: BTreeMap<String, i64>,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

impl From<&Task> for TaskDto {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            config: task.config.clone(),
            interval: task.interval,
            route: task.route.clone(),
            metrics: task.metrics.clone(),
            enabled: task.enabled,
            created: task.created,
            updated: task.updated,
        }
    }
}

/// Données nécessaires à la création ou mise à jour d'une tâche
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub org_id: i64,
    pub config: TaskConfig,
    pub interval: i64,
    pub route: TaskRoute,
    pub enabled: bool,
    pub metrics: BTreeMap<String, i64>,
}

/// Filtres de GET /tasks ; org_id vient du contexte appelant, jamais de la query string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskQuery {
    pub name: Option<String>,
    pub metric: Option<String>,
    pub metric_version: Option<i64>,
    pub enabled: Option<bool>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    pub page: Option<usize>,
    #[serde(skip)]
    pub org_id: Option<i64>,
}

/// Ordres de tri acceptés par `orderBy`
pub const TASK_ORDER_FIELDS: [&str; 5] = ["id", "name", "interval", "created", "updated"];

impl TaskQuery {
    pub fn matches(&self, task: &Task) -> bool {
        if self.org_id.is_some_and(|org| org != task.org_id) {
            return false;
        }
        if self.name.as_ref().is_some_and(|name| name != &task.name) {
            return false;
        }
        if self.enabled.is_some_and(|enabled| enabled != task.enabled) {
            return false;
        }
        match (&self.metric, self.metric_version) {
            (Some(ns), Some(version)) => task.metrics.get(ns) == Some(&version),
            (Some(ns), None) => task.metrics.contains_key(ns),
            (None, _) => true,
        }
    }

    /// Fenêtre (offset, taille) ; page commence à 1 et n'a de sens qu'avec limit
    pub fn window(&self) -> (usize, usize) {
        match self.limit {
            Some(limit) => {
                let page = self.page.unwrap_or(1).max(1);
                ((page - 1).saturating_mul(limit), limit)
            }
            None => (0, usize::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_entry_defaults() {
        let entries: Vec<CatalogEntry> =
            serde_json::from_str(r#"[{"namespace":"/cpu/usage","version":1}]"#).unwrap();
        assert_eq!(entries[0].namespace, "/cpu/usage");
        assert!(entries[0].policy.is_empty());
    }

    #[test]
    fn test_metric_inherits_agent_ownership() {
        let mut agent = Agent::new(9, "collector", 42);
        agent.public = true;
        let entry = CatalogEntry { namespace: "/mem/free".into(), version: 3, policy: vec![] };

        let metric = Metric::from_catalog(&agent, entry);
        assert_eq!(metric.owner, 42);
        assert!(metric.public);
        assert_eq!(metric.key(), (42, "/mem/free".to_string(), 3));
    }

    #[test]
    fn test_task_query_filters() {
        let now = OffsetDateTime::now_utc();
        let task = Task {
            id: 1,
            name: "ping".into(),
            org_id: 7,
            config: TaskConfig::new(),
            interval: 60,
            route: TaskRoute::any(1),
            enabled: true,
            metrics: BTreeMap::from([("/ping/avg".to_string(), 2)]),
            created: now,
            updated: now,
        };

        let query: TaskQuery = serde_json::from_value(serde_json::json!({
            "metric": "/ping/avg",
            "metricVersion": 2,
            "enabled": true
        }))
        .unwrap();
        assert!(query.matches(&task));
        assert!(!TaskQuery { metric_version: Some(1), ..query.clone() }.matches(&task));
        assert!(!TaskQuery { org_id: Some(8), ..query.clone() }.matches(&task));
        assert!(!TaskQuery { name: Some("dns".into()), ..query }.matches(&task));
    }

    #[test]
    fn test_task_query_window() {
        assert_eq!(TaskQuery::default().window(), (0, usize::MAX));
        let query = TaskQuery { limit: Some(10), page: Some(3), ..Default::default() };
        assert_eq!(query.window(), (20, 10));
        let query = TaskQuery { limit: Some(10), page: Some(0), ..Default::default() };
        assert_eq!(query.window(), (0, 10));
    }

    #[test]
    fn test_task_dto_hides_org() {
        let now = OffsetDateTime::now_utc();
        let task = Task {
            id: 1,
            name: "ping".into(),
            org_id: 77,
            config: TaskConfig::new(),
            interval: 60,
            route: TaskRoute::any(1),
            enabled: true,
            metrics: BTreeMap::new(),
            created: now,
            updated: now,
        };
        let json = serde_json::to_value(TaskDto::from(&task)).unwrap();
        assert!(json.get("org_id").is_none());
        assert_eq!(json["route"]["type"], "any");
    }
}
