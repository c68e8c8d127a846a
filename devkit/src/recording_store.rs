/*!
Store instrumenté : délègue à un MemoryStore, compte les appels et
permet d'injecter des pannes par opération.
*/

use async_trait::async_trait;
use fleet_kernel::models::{Agent, Metric, SessionRecord, TaskDto};
use fleet_kernel::store::{MemoryStore, SessionStore, StoreError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct RecordingStore {
    pub inner: Arc<MemoryStore>,
    add_session_calls: AtomicUsize,
    delete_session_calls: AtomicUsize,
    task_queries: AtomicUsize,
    metric_upserts: AtomicUsize,
    fail_add_session: AtomicBool,
    fail_delete_session: AtomicBool,
    fail_task_queries: AtomicBool,
    add_session_delay: Mutex<Option<Duration>>,
}

impl RecordingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner, ..Default::default() }
    }

    pub fn fail_add_session(&self, fail: bool) {
        self.fail_add_session.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete_session(&self, fail: bool) {
        self.fail_delete_session.store(fail, Ordering::SeqCst);
    }

    pub fn fail_task_queries(&self, fail: bool) {
        self.fail_task_queries.store(fail, Ordering::SeqCst);
    }

    /// Ralentit add_session (horloge tokio) pour ouvrir une fenêtre de course
    pub fn delay_add_session(&self, delay: Duration) {
        *self.add_session_delay.lock() = Some(delay);
    }

    pub fn add_session_calls(&self) -> usize {
        self.add_session_calls.load(Ordering::SeqCst)
    }

    pub fn delete_session_calls(&self) -> usize {
        self.delete_session_calls.load(Ordering::SeqCst)
    }

    pub fn task_queries(&self) -> usize {
        self.task_queries.load(Ordering::SeqCst)
    }

    pub fn metric_upserts(&self) -> usize {
        self.metric_upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for RecordingStore {
    async fn add_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.add_session_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.add_session_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_add_session.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected add_session failure".into()));
        }
        self.inner.add_session(record).await
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.delete_session_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete_session.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected delete_session failure".into()));
        }
        self.inner.delete_session(id).await
    }

    async fn get_agent_tasks(&self, agent: &Agent) -> Result<Vec<TaskDto>, StoreError> {
        self.task_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_task_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected task query failure".into()));
        }
        self.inner.get_agent_tasks(agent).await
    }

    async fn add_missing_metrics(&self, metrics: Vec<Metric>) -> Result<usize, StoreError> {
        self.metric_upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.add_missing_metrics(metrics).await
    }
}
