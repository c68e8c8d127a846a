use fleet_devkit::{fixtures, SessionHarness};
use fleet_kernel::models::TaskDto;
use fleet_kernel::routes::TaskRoute;
use fleet_kernel::transport::{EVENT_CATALOG, EVENT_DISCONNECT, EVENT_HEARTBEAT, EVENT_TASK_UPDATE};
use fleet_kernel::{KernelError, SessionRegistry, SessionState};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::sleep;

/// Laisse tourner les tâches lancées par les handlers sans atteindre un tick
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_start_records_session_and_pushes_tasks() {
    let h = SessionHarness::new();
    h.memory().add_task(fixtures::task("pinned", TaskRoute::any(1))).unwrap();
    h.memory().add_task(fixtures::task("elsewhere", TaskRoute::any(2))).unwrap();

    let session = h.session();
    session.start().await.unwrap();

    assert_eq!(session.state(), SessionState::Running);
    assert!(h.transport.is_listening());
    assert!(h.transport.has_handler(EVENT_DISCONNECT));
    assert!(h.transport.has_handler(EVENT_CATALOG));

    let records = h.memory().list_sessions();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, session.id());
    assert_eq!(records[0].agent_id, 1);
    assert_eq!(records[0].version, 3);
    assert_eq!(records[0].server, "kernel-test");
    assert_eq!(records[0].remote_ip, "192.0.2.10:51234");

    let updates = h.transport.events_named(EVENT_TASK_UPDATE);
    assert_eq!(updates.len(), 1);
    let tasks: Vec<TaskDto> = serde_json::from_slice(&updates[0].payload).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, "pinned");

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_within_two_seconds() {
    let h = SessionHarness::new();
    let session = h.session();
    session.start().await.unwrap();
    assert_eq!(h.transport.count(EVENT_HEARTBEAT), 0);

    sleep(Duration::from_millis(2100)).await;
    let beats = h.transport.events_named(EVENT_HEARTBEAT);
    assert_eq!(beats.len(), 1);
    let stamp = std::str::from_utf8(&beats[0].payload).unwrap();
    assert!(OffsetDateTime::parse(stamp, &Rfc3339).is_ok());

    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.transport.count(EVENT_HEARTBEAT), 3);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_task_updates_every_minute() {
    let h = SessionHarness::new();
    let session = h.session();
    session.start().await.unwrap();
    assert_eq!(h.transport.count(EVENT_TASK_UPDATE), 1);

    sleep(Duration::from_millis(59_500)).await;
    assert_eq!(h.transport.count(EVENT_TASK_UPDATE), 1);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.transport.count(EVENT_TASK_UPDATE), 2);

    // un changement de tâche est visible au push suivant
    h.memory().add_task(fixtures::task("late", TaskRoute::by_ids([1]))).unwrap();
    sleep(Duration::from_secs(60)).await;
    let updates = h.transport.events_named(EVENT_TASK_UPDATE);
    assert_eq!(updates.len(), 3);
    let tasks: Vec<TaskDto> = serde_json::from_slice(&updates[2].payload).unwrap();
    assert_eq!(tasks[0].name, "late");

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_aborts_start() {
    let h = SessionHarness::new();
    h.store.fail_add_session(true);
    let session = h.session();

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, KernelError::Persistence(_)));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.is_closed());
    assert!(h.transport.is_closed());
    assert!(!h.transport.is_listening());
    assert_eq!(session.running_activities(), 0);
    assert_eq!(h.store.delete_session_calls(), 0);

    sleep(Duration::from_secs(120)).await;
    assert!(h.transport.emitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_handler_bind_failure_removes_record() {
    let h = SessionHarness::new();
    h.transport.refuse_handler(EVENT_CATALOG);
    let session = h.session();

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, KernelError::Transport(_)));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(h.store.add_session_calls(), 1);
    assert_eq!(h.store.delete_session_calls(), 1);
    assert!(h.memory().list_sessions().is_empty());
    assert_eq!(session.running_activities(), 0);
    assert!(h.transport.emitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_is_rejected() {
    let h = SessionHarness::new();
    let session = h.session();
    session.start().await.unwrap();

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, KernelError::InvalidState(SessionState::Running)));
    assert_eq!(h.store.add_session_calls(), 1);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_after_close_is_rejected() {
    let h = SessionHarness::new();
    let session = h.session();
    session.close().await;

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, KernelError::InvalidState(SessionState::Closed)));
    assert_eq!(h.store.add_session_calls(), 0);
    assert_eq!(h.store.delete_session_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_during_slow_start_leaves_no_record() {
    let h = SessionHarness::new();
    h.store.delay_add_session(Duration::from_secs(1));
    let session = h.session();

    let starting = tokio::spawn({
        let session = session.clone();
        async move { session.start().await }
    });
    sleep(Duration::from_millis(100)).await;
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(KernelError::InvalidState(_))));
    assert!(h.memory().list_sessions().is_empty());
    assert_eq!(h.store.delete_session_calls(), 1);
    assert_eq!(session.running_activities(), 0);
    assert!(h.transport.emitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_racing_close_tears_down_once() {
    let h = SessionHarness::new();
    let session = h.session();
    session.start().await.unwrap();

    assert!(h.transport.simulate_disconnect());
    join_all((0..8).map(|_| session.close())).await;
    session.closed().await;
    settle().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(h.transport.close_calls(), 1);
    assert_eq!(h.store.delete_session_calls(), 1);
    assert!(h.memory().list_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_peer_disconnect_closes_session() {
    let h = SessionHarness::new();
    let session = h.session();
    session.start().await.unwrap();

    h.transport.simulate_disconnect();
    tokio::time::timeout(Duration::from_secs(1), session.closed()).await.unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(h.transport.is_closed());
    assert!(h.memory().list_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_nothing_emitted_after_close() {
    let h = SessionHarness::new();
    let session = h.session();
    session.start().await.unwrap();
    sleep(Duration::from_millis(4100)).await;

    session.close().await;
    let emitted = h.transport.emitted().len();

    settle().await;
    assert_eq!(session.running_activities(), 0);

    sleep(Duration::from_secs(180)).await;
    assert_eq!(h.transport.emitted().len(), emitted);
    assert_eq!(h.store.task_queries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_catalog_registers_missing_metrics() {
    let mut agent = fixtures::agent(7, 42);
    agent.public = true;
    let h = SessionHarness::new().with_agent(agent);
    let session = h.session();
    session.start().await.unwrap();

    let payload = fixtures::catalog_payload(&[("/cpu/usage", 1), ("/mem/free", 2)]);
    assert!(h.transport.simulate_incoming(EVENT_CATALOG, payload.clone()));
    settle().await;

    let metrics = h.memory().list_metrics(42);
    assert_eq!(metrics.len(), 2);
    assert!(metrics.iter().all(|m| m.owner == 42 && m.public));

    // même catalogue : aucun doublon
    assert!(h.transport.simulate_incoming(EVENT_CATALOG, payload));
    settle().await;
    assert_eq!(h.memory().metric_count(), 2);
    assert_eq!(h.store.metric_upserts(), 2);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_catalog_keeps_session_running() {
    let h = SessionHarness::new();
    let session = h.session();
    session.start().await.unwrap();

    assert!(h.transport.simulate_incoming(EVENT_CATALOG, "not json"));
    settle().await;
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(h.store.metric_upserts(), 0);
    assert!(matches!(
        session.ingest_catalog(b"{\"namespace\":").await,
        Err(KernelError::ProtocolDecode(_))
    ));

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.transport.count(EVENT_HEARTBEAT), 1);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_steady_state_failures_are_tolerated() {
    let h = SessionHarness::new();
    h.store.fail_task_queries(true);
    let session = h.session();

    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(h.transport.count(EVENT_TASK_UPDATE), 0);

    h.transport.set_fail_emits(true);
    sleep(Duration::from_millis(4100)).await;
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(h.transport.count(EVENT_HEARTBEAT), 0);

    h.transport.set_fail_emits(false);
    h.store.fail_task_queries(false);
    sleep(Duration::from_secs(60)).await;
    assert!(h.transport.count(EVENT_HEARTBEAT) > 0);
    assert_eq!(h.transport.count(EVENT_TASK_UPDATE), 1);
    assert_eq!(session.running_activities(), 2);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_teardown_survives_delete_failure() {
    let h = SessionHarness::new();
    h.store.fail_delete_session(true);
    let session = h.session();
    session.start().await.unwrap();

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.is_closed());
    assert!(h.transport.is_closed());
    assert_eq!(h.store.delete_session_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registry_forgets_closed_sessions() {
    let h = SessionHarness::new();
    let registry = Arc::new(SessionRegistry::new());
    let session = h.session();
    session.start().await.unwrap();

    registry.track(session.clone());
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.list()[0].state, SessionState::Running);
    assert!(registry.get(session.id()).is_some());

    h.transport.simulate_disconnect();
    session.closed().await;
    settle().await;
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_registry_close_all() {
    let first = SessionHarness::new();
    let second = SessionHarness::new();
    let registry = SessionRegistry::new();
    for h in [&first, &second] {
        let session = h.session();
        session.start().await.unwrap();
        registry.insert(session);
    }

    registry.close_all().await;
    assert!(registry.is_empty());
    assert!(first.transport.is_closed());
    assert!(second.transport.is_closed());
    assert!(first.memory().list_sessions().is_empty());
}
