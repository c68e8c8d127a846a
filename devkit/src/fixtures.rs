//! Builders d'agents, tâches et catalogues pour les tests.

use fleet_kernel::models::{Agent, CatalogEntry, NewTask, PolicyRule, TaskConfig};
use fleet_kernel::routes::TaskRoute;
use serde_json::json;
use std::collections::BTreeMap;

pub fn agent(id: i64, owner: i64) -> Agent {
    Agent::new(id, format!("agent-{id}"), owner)
}

pub fn tagged_agent(id: i64, owner: i64, tags: &[&str]) -> Agent {
    let mut agent = agent(id, owner);
    agent.tags = tags.iter().map(|t| t.to_string()).collect();
    agent
}

pub fn task(name: &str, route: TaskRoute) -> NewTask {
    let mut config = TaskConfig::new();
    config.insert("ping".into(), BTreeMap::from([("hostname".to_string(), json!("localhost"))]));
    NewTask {
        name: name.to_string(),
        org_id: 1,
        config,
        interval: 60,
        route,
        enabled: true,
        metrics: BTreeMap::from([("/ping/avg".to_string(), 1)]),
    }
}

pub fn catalog_entry(namespace: &str, version: i64) -> CatalogEntry {
    CatalogEntry {
        namespace: namespace.to_string(),
        version,
        policy: vec![PolicyRule {
            name: "hostname".into(),
            kind: "string".into(),
            default: None,
            required: true,
            minimum: None,
            maximum: None,
        }],
    }
}

/// Payload `catalog` tel qu'envoyé par un agent
pub fn catalog_payload(entries: &[(&str, i64)]) -> Vec<u8> {
    let catalog: Vec<CatalogEntry> = entries.iter().map(|(ns, v)| catalog_entry(ns, *v)).collect();
    serde_json::to_vec(&catalog).unwrap_or_default()
}
