use crate::registry::SessionRegistry;
use crate::store::MemoryStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub sessions_active: u32,
    pub agents_known: u32,
    pub tasks: u32,
    pub metrics: u32,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, store: &MemoryStore, registry: &SessionRegistry) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            sessions_active: registry.len() as u32,
            agents_known: store.list_agents().len() as u32,
            tasks: store.task_count() as u32,
            metrics: store.metric_count() as u32,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }

    /// Log périodique de l'état du kernel, jusqu'à l'arrêt
    pub fn spawn_health_reporter(
        &self,
        store: Arc<MemoryStore>,
        registry: Arc<SessionRegistry>,
        shutdown: CancellationToken,
    ) {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        let health = tracker.get_health(&store, &registry);
                        info!(
                            uptime = health.uptime_seconds,
                            sessions = health.sessions_active,
                            agents = health.agents_known,
                            memory_mb = health.memory_usage_mb,
                            "kernel health"
                        );
                    }
                }
            }
        });
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
