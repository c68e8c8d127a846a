/**
 * TASK ROUTES - Modèle de routage des tâches vers les agents
 *
 * RÔLE :
 * Décrit quels agents reçoivent une tâche : un slot précis (`any`), tous les
 * agents portant un ensemble de tags (`byTags`) ou une liste explicite
 * d'identifiants (`byIds`). Module pur, aucune I/O.
 *
 * FONCTIONNEMENT :
 * - Décodage en deux temps : enveloppe générique {type, config} puis schéma
 *   propre au type, choisi dans une table (ajouter un type = ajouter une ligne)
 * - La config est normalisée en une map générique clé -> valeur JSON
 * - Validation : exactement une clé, celle imposée par le type
 *
 * FORMAT PERSISTÉ :
 * ```json
 * {"type": "byTags", "config": {"tags": ["prod", "db"]}}
 * ```
 */

use crate::models::Agent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Invalid route config")]
    InvalidRouteConfig,
    #[error("unknown route type: {0}")]
    UnknownRouteType(String),
    #[error("route decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RouteType {
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "byTags")]
    ByTags,
    #[serde(rename = "byIds")]
    ByIds,
}

/// Schéma d'un type de route : nom sur le fil, clé imposée, forme de la valeur
struct RouteSchema {
    route_type: RouteType,
    name: &'static str,
    key: &'static str,
    normalize: fn(Value) -> Result<Value, serde_json::Error>,
}

static ROUTE_SCHEMAS: [RouteSchema; 3] = [
    RouteSchema { route_type: RouteType::Any, name: "any", key: "id", normalize: normalize_id },
    RouteSchema { route_type: RouteType::ByTags, name: "byTags", key: "tags", normalize: normalize_tags },
    RouteSchema { route_type: RouteType::ByIds, name: "byIds", key: "ids", normalize: normalize_ids },
];

fn normalize_id(value: Value) -> Result<Value, serde_json::Error> {
    serde_json::from_value::<i64>(value).map(Value::from)
}

fn normalize_tags(value: Value) -> Result<Value, serde_json::Error> {
    serde_json::from_value::<Vec<String>>(value).map(Value::from)
}

fn normalize_ids(value: Value) -> Result<Value, serde_json::Error> {
    serde_json::from_value::<Vec<i64>>(value).map(Value::from)
}

impl RouteType {
    fn schema(self) -> &'static RouteSchema {
        // la table couvre chaque variante
        match self {
            RouteType::Any => &ROUTE_SCHEMAS[0],
            RouteType::ByTags => &ROUTE_SCHEMAS[1],
            RouteType::ByIds => &ROUTE_SCHEMAS[2],
        }
    }

    pub fn as_str(self) -> &'static str {
        self.schema().name
    }

    /// Clé unique que la config doit contenir pour ce type
    pub fn config_key(self) -> &'static str {
        self.schema().key
    }
}

impl FromStr for RouteType {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ROUTE_SCHEMAS
            .iter()
            .find(|schema| schema.name == s)
            .map(|schema| schema.route_type)
            .ok_or_else(|| RouteError::UnknownRouteType(s.to_string()))
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enveloppe brute : type encore en texte, config pas encore typée
#[derive(Debug, Deserialize)]
struct RawRoute {
    #[serde(rename = "type")]
    route_type: String,
    #[serde(default)]
    config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRoute")]
pub struct TaskRoute {
    #[serde(rename = "type")]
    pub route_type: RouteType,
    pub config: BTreeMap<String, Value>,
}

/// Cible typée d'une route validée
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Any(i64),
    ByTags(Vec<String>),
    ByIds(Vec<i64>),
}

impl TryFrom<RawRoute> for TaskRoute {
    type Error = RouteError;

    fn try_from(raw: RawRoute) -> Result<Self, Self::Error> {
        let route_type: RouteType = raw.route_type.parse()?;
        let schema = route_type.schema();

        // config absente ou null = map vide
        let fields: Map<String, Value> = match raw.config {
            None | Some(Value::Null) => Map::new(),
            Some(value) => serde_json::from_value(value)?,
        };

        // Seule la clé imposée est typée ; les autres passent telles quelles
        // pour que la validation signale une config invalide plutôt qu'un JSON cassé.
        let mut config = BTreeMap::new();
        for (key, value) in fields {
            let value = if key == schema.key { (schema.normalize)(value)? } else { value };
            config.insert(key, value);
        }

        Ok(Self { route_type, config })
    }
}

impl TaskRoute {
    pub fn any(id: i64) -> Self {
        Self::single(RouteType::Any, Value::from(id))
    }

    pub fn by_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        Self::single(RouteType::ByTags, Value::from(tags))
    }

    pub fn by_ids<I: IntoIterator<Item = i64>>(ids: I) -> Self {
        let ids: Vec<i64> = ids.into_iter().collect();
        Self::single(RouteType::ByIds, Value::from(ids))
    }

    fn single(route_type: RouteType, value: Value) -> Self {
        let mut config = BTreeMap::new();
        config.insert(route_type.config_key().to_string(), value);
        Self { route_type, config }
    }

    /// Décode une route depuis sa forme persistée
    pub fn decode(bytes: &[u8]) -> Result<Self, RouteError> {
        let raw: RawRoute = serde_json::from_slice(bytes)?;
        Self::try_from(raw)
    }

    /// Décode une route déjà parsée en JSON (corps de requête HTTP)
    pub fn from_value(value: Value) -> Result<Self, RouteError> {
        let raw: RawRoute = serde_json::from_value(value)?;
        Self::try_from(raw)
    }

    /// Sérialise {type, config} en un seul enregistrement opaque
    pub fn encode(&self) -> Result<Vec<u8>, RouteError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<(), RouteError> {
        let key = self.route_type.config_key();
        if self.config.len() != 1 || !self.config.contains_key(key) {
            return Err(RouteError::InvalidRouteConfig);
        }
        Ok(())
    }

    /// Décode puis valide ; chemin d'entrée de toute route venant de l'extérieur
    pub fn check(bytes: &[u8]) -> Result<Self, RouteError> {
        let route = Self::decode(bytes)?;
        route.validate()?;
        Ok(route)
    }

    pub fn target(&self) -> Result<RouteTarget, RouteError> {
        self.validate()?;
        let value = self.config[self.route_type.config_key()].clone();
        let target = match self.route_type {
            RouteType::Any => RouteTarget::Any(serde_json::from_value(value)?),
            RouteType::ByTags => RouteTarget::ByTags(serde_json::from_value(value)?),
            RouteType::ByIds => RouteTarget::ByIds(serde_json::from_value(value)?),
        };
        Ok(target)
    }

    /// Vrai si l'agent fait partie des cibles de la route.
    /// Une liste de tags vide ne cible personne.
    pub fn matches(&self, agent: &Agent) -> bool {
        match self.target() {
            Ok(RouteTarget::Any(id)) => id == agent.id,
            Ok(RouteTarget::ByIds(ids)) => ids.contains(&agent.id),
            Ok(RouteTarget::ByTags(tags)) => {
                !tags.is_empty() && tags.iter().all(|tag| agent.tags.contains(tag))
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent(id: i64, tags: &[&str]) -> Agent {
        let mut agent = Agent::new(id, format!("agent-{id}"), 1);
        agent.tags = tags.iter().map(|t| t.to_string()).collect();
        agent
    }

    #[test]
    fn test_round_trip_all_variants() {
        let routes = [
            TaskRoute::any(7),
            TaskRoute::by_tags(["prod", "db"]),
            TaskRoute::by_ids([1, 2, 3]),
        ];
        for route in routes {
            let bytes = route.encode().unwrap();
            assert_eq!(TaskRoute::decode(&bytes).unwrap(), route);
        }
    }

    #[test]
    fn test_encoded_shape() {
        let encoded = TaskRoute::by_tags(["prod"]).encode().unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value, json!({"type": "byTags", "config": {"tags": ["prod"]}}));
    }

    #[test]
    fn test_validate_canonical_by_tags() {
        let route = TaskRoute::check(br#"{"type":"byTags","config":{"tags":["prod","db"]}}"#).unwrap();
        assert_eq!(route.target().unwrap(), RouteTarget::ByTags(vec!["prod".into(), "db".into()]));
    }

    #[test]
    fn test_extra_key_is_invalid_config() {
        let route = TaskRoute::decode(br#"{"type":"byTags","config":{"tags":["prod"],"extra":1}}"#).unwrap();
        assert!(matches!(route.validate(), Err(RouteError::InvalidRouteConfig)));
    }

    #[test]
    fn test_missing_or_wrong_key_is_invalid_config() {
        for body in [
            r#"{"type":"any","config":{}}"#,
            r#"{"type":"any"}"#,
            r#"{"type":"byIds","config":{"id":3}}"#,
            r#"{"type":"byTags","config":{"ids":[1]}}"#,
        ] {
            let result = TaskRoute::check(body.as_bytes());
            assert!(matches!(result, Err(RouteError::InvalidRouteConfig)), "{body}");
        }
    }

    #[test]
    fn test_unknown_type() {
        let result = TaskRoute::check(br#"{"type":"foo","config":{}}"#);
        assert!(matches!(result, Err(RouteError::UnknownRouteType(t)) if t == "foo"));
        assert!(matches!("byName".parse::<RouteType>(), Err(RouteError::UnknownRouteType(_))));
    }

    #[test]
    fn test_null_config_is_invalid_config() {
        let route = TaskRoute::decode(br#"{"type":"any","config":null}"#).unwrap();
        assert!(route.config.is_empty());
        assert!(matches!(route.validate(), Err(RouteError::InvalidRouteConfig)));
    }

    #[test]
    fn test_type_checked_before_config() {
        let result = TaskRoute::check(br#"{"type":"foo","config":[1]}"#);
        assert!(matches!(result, Err(RouteError::UnknownRouteType(t)) if t == "foo"));
    }

    #[test]
    fn test_payload_shape_mismatch_is_decode_error() {
        for body in [
            r#"{"type":"any","config":{"id":"seven"}}"#,
            r#"{"type":"byTags","config":{"tags":[1,2]}}"#,
            r#"{"type":"byIds","config":{"ids":"1,2"}}"#,
            r#"{"type":"byIds","config":[1]}"#,
        ] {
            let result = TaskRoute::decode(body.as_bytes());
            assert!(matches!(result, Err(RouteError::Decode(_))), "{body}");
        }
    }

    #[test]
    fn test_from_value_matches_decode() {
        let value = json!({"type": "byIds", "config": {"ids": [4, 5]}});
        let from_value = TaskRoute::from_value(value.clone()).unwrap();
        let decoded = TaskRoute::decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(from_value, decoded);
    }

    #[test]
    fn test_route_matching() {
        let db = agent(3, &["prod", "db"]);
        let web = agent(4, &["prod"]);

        assert!(TaskRoute::any(3).matches(&db));
        assert!(!TaskRoute::any(3).matches(&web));

        assert!(TaskRoute::by_ids([1, 4]).matches(&web));
        assert!(!TaskRoute::by_ids([1, 4]).matches(&db));

        let tags = TaskRoute::by_tags(["prod", "db"]);
        assert!(tags.matches(&db));
        assert!(!tags.matches(&web));
        assert!(!TaskRoute::by_tags(Vec::<String>::new()).matches(&db));
    }

    #[test]
    fn test_invalid_route_matches_nobody() {
        let route = TaskRoute::decode(br#"{"type":"any","config":{"id":3,"extra":true}}"#).unwrap();
        assert!(!route.matches(&agent(3, &[])));
    }
}
