use crate::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub server: ServerConf,
    pub session: SessionConf,
    pub store: StoreConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub host: String,
    pub port: u16,
    /// Identité enregistrée dans chaque session (hostname sinon)
    pub name: Option<String>,
    pub api_key: Option<String>,
    /// Taille de la file d'émission par connexion
    pub send_queue: usize,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8080, name: None, api_key: None, send_queue: 64 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConf {
    pub heartbeat_interval_secs: u64,
    pub task_poll_interval_secs: u64,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self { heartbeat_interval_secs: 2, task_poll_interval_secs: 60 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub data_file: Option<String>, // ex: "./data/store.json"
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { data_file: Some("./data/store.json".into()) }
    }
}

impl KernelConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_interval_secs.max(1)),
            task_poll_interval: Duration::from_secs(self.session.task_poll_interval_secs.max(1)),
            server: self.server.name.clone().unwrap_or_else(server_hostname),
        }
    }

    /// FLEET_API_KEY prime sur le fichier
    pub fn api_key(&self) -> Option<String> {
        std::env::var("FLEET_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.server.api_key.clone().filter(|key| !key.is_empty()))
    }
}

pub fn server_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLEET_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        warn!(%path, "no config file, using defaults");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    parse_config(&txt).unwrap_or_else(|e| {
        warn!(%path, "invalid config: {e}");
        KernelConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config(
            "server:\n  port: 9000\n  name: kernel-eu-1\nsession:\n  task_poll_interval_secs: 30\n",
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.session.heartbeat_interval_secs, 2);

        let settings = cfg.session_settings();
        assert_eq!(settings.task_poll_interval, Duration::from_secs(30));
        assert_eq!(settings.server, "kernel-eu-1");
    }

    #[test]
    fn test_empty_file_is_default() {
        let cfg = parse_config("  \n").unwrap();
        assert_eq!(cfg.session.task_poll_interval_secs, 60);
        assert_eq!(cfg.store.data_file.as_deref(), Some("./data/store.json"));
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(parse_config("server: [1, 2").is_err());
    }
}
