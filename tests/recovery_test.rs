mod common;

use chrono::Utc;
use common::{cache_config, engine, engine_config, eventually, registry, Calls};
use flowloom::cache::TieredCache;
use flowloom::recovery::Reaper;
use flowloom::runtime::events::{ChannelSink, NoopSink, StatusEvent};
use flowloom::runtime::run::{FailureReason, Run, RunStatus};
use flowloom::runtime::RunStorage;
use flowloom::trigger::{WaitOutcome, WaiterScope};
use flowloom::{Edge, EventWaiter, ExecutionEngine, Node, TriggerFiring, Workflow};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn approval_workflow() -> Arc<Workflow> {
    Arc::new(Workflow::new(
        "approval",
        vec![
            Node::new("start", "start", json!({})),
            Node::new("approval", "waitForEvent", json!({ "event_type": "approval" })),
            Node::new("after", "echo", json!({})),
        ],
        vec![Edge::new("start", "approval"), Edge::new("approval", "after")],
    ))
}

fn persisted_engine(calls: &Calls, cache: Arc<TieredCache>, storage: RunStorage) -> Arc<ExecutionEngine> {
    Arc::new(
        ExecutionEngine::new(
            registry(calls),
            cache,
            Arc::new(EventWaiter::new()),
            Arc::new(NoopSink),
            engine_config(),
        )
        .with_run_storage(storage),
    )
}

#[tokio::test]
async fn stale_run_is_crashed_and_its_waiters_released() {
    let calls = Calls::default();
    let engine = engine(&calls);
    let (sink, mut events) = ChannelSink::pair();

    let run = Run::new("orphan", None, json!({}));
    engine.runs().insert(&run);
    let waiter = engine
        .waiters()
        .register_scoped(
            "approval",
            "approval",
            None,
            WaiterScope {
                workflow_id: Some("orphan".into()),
                run_id: Some(run.id.clone()),
                allow_concurrent: false,
            },
        )
        .unwrap();
    engine
        .heartbeats()
        .beat_at(&run.id, Utc::now() - chrono::Duration::seconds(600))
        .await;

    let reaper = Reaper::new(
        Arc::clone(engine.runs()),
        engine.heartbeats().clone(),
        Arc::clone(engine.waiters()),
        Arc::new(sink),
        Duration::from_secs(30),
    );
    assert_eq!(reaper.reap_once().await, vec![run.id.clone()]);

    let record = engine.run_status(&run.id).unwrap();
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.failure.unwrap().reason, FailureReason::Crashed);
    assert_eq!(waiter.wait().await, WaitOutcome::Cancelled);
    assert!(engine.heartbeats().last_beat(&run.id).await.is_none());

    match events.recv().await.unwrap() {
        StatusEvent::Run { run_id, status, failure, .. } => {
            assert_eq!(run_id, run.id);
            assert_eq!(status, RunStatus::Error);
            assert_eq!(failure.unwrap().reason, FailureReason::Crashed);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // already terminal, nothing left to reap
    assert!(reaper.reap_once().await.is_empty());
}

#[tokio::test]
async fn live_run_waiting_on_an_event_is_left_alone() {
    let calls = Calls::default();
    let engine = engine(&calls);
    let handle = engine
        .start_run(approval_workflow(), TriggerFiring::manual(json!({})))
        .unwrap();
    eventually(|| engine.waiters().len() == 1).await;

    let reaper = Reaper::new(
        Arc::clone(engine.runs()),
        engine.heartbeats().clone(),
        Arc::clone(engine.waiters()),
        Arc::clone(engine.sink()),
        Duration::from_secs(30),
    );
    assert!(reaper.reap_once().await.is_empty());
    assert_eq!(
        engine.run_status(handle.run_id()).unwrap().status,
        RunStatus::Running
    );

    assert_eq!(engine.waiters().dispatch("approval", &json!({ "ok": true })), 1);
    let record = handle.wait().await.unwrap();
    assert_eq!(record.status, RunStatus::Success);
}

#[tokio::test]
async fn reaped_engine_run_stops_and_keeps_the_crash_status() {
    let calls = Calls::default();
    let engine = engine(&calls);
    let handle = engine
        .start_run(approval_workflow(), TriggerFiring::manual(json!({})))
        .unwrap();
    eventually(|| engine.waiters().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reaper = Reaper::new(
        Arc::clone(engine.runs()),
        engine.heartbeats().clone(),
        Arc::clone(engine.waiters()),
        Arc::clone(engine.sink()),
        Duration::ZERO,
    );
    assert_eq!(reaper.reap_once().await.len(), 1);
    assert!(engine.waiters().is_empty());

    let record = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.failure.unwrap().reason, FailureReason::Crashed);
    // nothing is resumed
    assert_eq!(calls.get("echo"), 0);
}

#[tokio::test]
async fn engine_persists_start_and_terminal_snapshots() {
    let calls = Calls::default();
    let storage = RunStorage::in_memory().await.unwrap();
    let engine = persisted_engine(
        &calls,
        Arc::new(TieredCache::in_memory(cache_config())),
        storage.clone(),
    );

    let handle = engine
        .start_run(approval_workflow(), TriggerFiring::manual(json!({})))
        .unwrap();
    let run_id = handle.run_id().to_string();
    eventually(|| engine.waiters().len() == 1).await;
    assert_eq!(storage.get(&run_id).await.unwrap().unwrap().status, RunStatus::Running);
    assert_eq!(storage.non_terminal().await.unwrap().len(), 1);

    engine.waiters().dispatch("approval", &json!({ "ok": true }));
    handle.wait().await.unwrap();

    let persisted = storage.get(&run_id).await.unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Success);
    assert!(persisted.outputs.contains_key("after"));
    assert!(storage.non_terminal().await.unwrap().is_empty());
}

#[tokio::test]
async fn restarted_process_crashes_runs_its_predecessor_left_behind() {
    let calls = Calls::default();
    let cache = Arc::new(TieredCache::in_memory(cache_config()));
    let storage = RunStorage::in_memory().await.unwrap();

    // first process parks a run on an event wait and is never heard from again
    let first = persisted_engine(&calls, Arc::clone(&cache), storage.clone());
    let handle = first
        .start_run(approval_workflow(), TriggerFiring::manual(json!({})))
        .unwrap();
    let run_id = handle.run_id().to_string();
    eventually(|| first.waiters().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // second process shares the cache and the run database, not the registry
    let second = persisted_engine(&calls, Arc::clone(&cache), storage.clone());
    assert!(second.run_status(&run_id).is_none());
    assert_eq!(
        second.run_record(&run_id).await.unwrap().status,
        RunStatus::Running
    );

    let (sink, mut events) = ChannelSink::pair();
    let reaper = Reaper::new(
        Arc::clone(second.runs()),
        second.heartbeats().clone(),
        Arc::clone(second.waiters()),
        Arc::new(sink),
        Duration::ZERO,
    )
    .with_storage(storage.clone());
    assert_eq!(reaper.reap_once().await, vec![run_id.clone()]);

    let persisted = storage.get(&run_id).await.unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Error);
    assert_eq!(persisted.failure.unwrap().reason, FailureReason::Crashed);
    assert_eq!(second.run_record(&run_id).await.unwrap().status, RunStatus::Error);
    match events.recv().await.unwrap() {
        StatusEvent::Run { run_id: id, status, .. } => {
            assert_eq!(id, run_id);
            assert_eq!(status, RunStatus::Error);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(reaper.reap_once().await.is_empty());

    // a late snapshot from the old process cannot resurrect the row
    assert!(first.cancel_run(&run_id));
    let record = handle.wait().await.unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
    let persisted = storage.get(&run_id).await.unwrap().unwrap();
    assert_eq!(persisted.failure.unwrap().reason, FailureReason::Crashed);
}
