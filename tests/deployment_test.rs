mod common;

use async_trait::async_trait;
use common::{cache_config, engine, engine_on, eventually, wait_terminal, Calls};
use flowloom::cache::TieredCache;
use flowloom::runtime::events::{BroadcastSink, StatusEvent};
use flowloom::error::NodeError;
use flowloom::runtime::run::RunStatus;
use flowloom::trigger::{PollSource, PollSources, WaitOutcome};
use flowloom::workflow::DeploymentStorage;
use flowloom::{DeploymentManager, EngineError, Edge, Node, Workflow};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

fn event_workflow(id: &str) -> Workflow {
    Workflow::new(
        id,
        vec![
            Node::new(
                "orders",
                "eventTrigger",
                json!({
                    "event_type": "order.created",
                    "filter": { "op": "gt", "field": "total", "value": 0.0 }
                }),
            ),
            Node::new("record", "echo", json!({})),
        ],
        vec![Edge::new("orders", "record")],
    )
}

async fn manager(calls: &Calls, storage: Option<DeploymentStorage>) -> DeploymentManager {
    DeploymentManager::new(engine(calls), PollSources::with_builtins(), storage)
        .await
        .unwrap()
}

#[tokio::test]
async fn push_trigger_spawns_a_run_per_event_and_rearms() {
    let calls = Calls::default();
    let manager = manager(&calls, None).await;
    let status = manager.deploy(event_workflow("orders")).await.unwrap();
    assert_eq!(status.triggers.len(), 1);
    assert!(status.triggers[0].armed);
    assert_eq!(manager.active_waiters().len(), 1);

    assert_eq!(manager.dispatch_event("order.created", &json!({ "total": 0 })), 0);
    assert_eq!(manager.dispatch_event("order.created", &json!({ "total": 10 })), 1);

    eventually(|| calls.get("echo") == 1 && manager.active_waiters().len() == 1).await;
    assert_eq!(manager.dispatch_event("order.created", &json!({ "total": 20 })), 1);
    eventually(|| calls.get("echo") == 2).await;

    let runs = manager.engine().runs().by_workflow("orders");
    assert_eq!(runs.len(), 2);
    for run in runs {
        let record = wait_terminal(manager.engine(), &run.run_id).await;
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.trigger_node.as_deref(), Some("orders"));
    }
}

#[tokio::test]
async fn cancel_disarms_triggers_and_releases_waiters() {
    let calls = Calls::default();
    let manager = manager(&calls, None).await;
    manager.deploy(event_workflow("orders")).await.unwrap();

    manager.cancel("orders").await.unwrap();
    assert!(manager.active_waiters().is_empty());
    assert_eq!(manager.dispatch_event("order.created", &json!({ "total": 10 })), 0);
    assert!(matches!(
        manager.get_status("orders").await,
        Err(EngineError::DeploymentNotFound(_))
    ));
    assert!(matches!(
        manager.cancel("orders").await,
        Err(EngineError::DeploymentNotFound(_))
    ));
}

#[tokio::test]
async fn redeploy_replaces_the_previous_triggers() {
    let calls = Calls::default();
    let manager = manager(&calls, None).await;
    manager.deploy(event_workflow("orders")).await.unwrap();
    manager.deploy(event_workflow("orders")).await.unwrap();

    assert_eq!(manager.list().await.len(), 1);
    eventually(|| manager.active_waiters().len() == 1).await;
    assert_eq!(manager.dispatch_event("order.created", &json!({ "total": 1 })), 1);
}

#[tokio::test]
async fn invalid_workflows_are_not_deployed() {
    let calls = Calls::default();
    let manager = manager(&calls, None).await;

    let cyclic = Workflow::new(
        "cyclic",
        vec![
            Node::new("start", "start", json!({})),
            Node::new("a", "echo", json!({})),
            Node::new("b", "echo", json!({})),
        ],
        vec![Edge::new("start", "a"), Edge::new("a", "b"), Edge::new("b", "a")],
    );
    assert!(matches!(
        manager.deploy(cyclic).await,
        Err(EngineError::CyclicGraph { .. })
    ));

    let unknown = Workflow::new(
        "unknown",
        vec![
            Node::new("start", "start", json!({})),
            Node::new("x", "doesNotExist", json!({})),
        ],
        vec![Edge::new("start", "x")],
    );
    assert!(matches!(
        manager.deploy(unknown).await,
        Err(EngineError::UnknownNodeKind(_))
    ));

    let bad_cron = Workflow::new(
        "bad-cron",
        vec![Node::new("tick", "cronTrigger", json!({ "schedule": "whenever" }))],
        vec![],
    );
    assert!(matches!(
        manager.deploy(bad_cron).await,
        Err(EngineError::TriggerConfig { .. })
    ));

    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn manual_runs_feed_the_payload_to_triggers() {
    let calls = Calls::default();
    let manager = manager(&calls, None).await;
    manager
        .deploy(Workflow::new(
            "manual",
            vec![
                Node::new("start", "manualTrigger", json!({})),
                Node::new("echo", "echo", json!({})),
            ],
            vec![Edge::new("start", "echo")],
        ))
        .await
        .unwrap();

    let run_id = manager.run_now("manual", json!({ "hello": "world" })).unwrap();
    let record = wait_terminal(manager.engine(), &run_id).await;
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.outputs["echo"], json!({ "hello": "world" }));
    assert_eq!(manager.run_status(&run_id).await.unwrap().run_id, run_id);

    assert!(matches!(
        manager.run_now("missing", json!({})),
        Err(EngineError::DeploymentNotFound(_))
    ));
}

struct Inbox {
    batches: Mutex<Vec<Vec<Value>>>,
}

#[async_trait]
impl PollSource for Inbox {
    async fn poll(&self, _node: &Node) -> Result<Vec<Value>, NodeError> {
        let mut batches = self.batches.lock();
        Ok(if batches.is_empty() { Vec::new() } else { batches.remove(0) })
    }
}

#[tokio::test]
async fn poll_trigger_spawns_one_run_per_new_item() {
    let calls = Calls::default();
    let mut sources = PollSources::new();
    sources.register(
        "inbox",
        Arc::new(Inbox {
            batches: Mutex::new(vec![
                vec![json!({ "id": "m1" }), json!({ "id": "m2" })],
                vec![json!({ "id": "m2" }), json!({ "id": "m3" })],
            ]),
        }),
    );
    let manager = DeploymentManager::new(engine(&calls), sources, None).await.unwrap();

    manager
        .deploy(Workflow::new(
            "mail",
            vec![
                Node::new("inbox", "pollTrigger", json!({ "source": "inbox", "interval_secs": 1 })),
                Node::new("handle", "echo", json!({})),
            ],
            vec![Edge::new("inbox", "handle")],
        ))
        .await
        .unwrap();

    let handled = || -> Vec<Value> {
        manager
            .engine()
            .runs()
            .by_workflow("mail")
            .into_iter()
            .filter_map(|r| r.outputs.get("handle").map(|o| o["id"].clone()))
            .collect()
    };
    eventually(|| handled().len() == 3).await;
    let mut ids = handled();
    ids.sort_by_key(|v| v.to_string());
    assert_eq!(ids, vec![json!("m1"), json!("m2"), json!("m3")]);

    manager.cancel("mail").await.unwrap();
}

#[tokio::test]
async fn persisted_deployments_are_restored() {
    let storage = DeploymentStorage::in_memory().await.unwrap();
    let calls = Calls::default();

    let first = manager(&calls, Some(storage.clone())).await;
    first.start().await.unwrap();
    first.deploy(event_workflow("orders")).await.unwrap();
    first.shutdown().await.unwrap();

    let second = manager(&calls, Some(storage.clone())).await;
    assert_eq!(second.restore().await.unwrap(), 1);
    assert_eq!(second.get_status("orders").await.unwrap().triggers.len(), 1);
    assert_eq!(second.active_waiters().len(), 1);

    second.cancel("orders").await.unwrap();
    assert!(storage.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn waiter_filter_holds_back_non_matching_events() {
    let calls = Calls::default();
    let engine = engine(&calls);
    let waiters = engine.waiters();
    let filter = serde_json::from_value(json!({ "op": "in", "field": "status", "values": ["paid", "settled"] })).unwrap();
    let mut waiter = waiters.register("invoice", "node", Some(filter)).unwrap();

    assert_eq!(waiters.dispatch("invoice", &json!({ "status": "draft" })), 0);
    assert!(waiter.try_outcome().is_none());

    assert_eq!(waiters.dispatch("invoice", &json!({ "status": "paid" })), 1);
    assert_eq!(waiters.dispatch("invoice", &json!({ "status": "paid" })), 0);
    assert!(matches!(
        waiter.try_outcome(),
        Some(WaitOutcome::Event(payload)) if payload == json!({ "status": "paid" })
    ));
}

#[tokio::test]
async fn operators_can_cancel_waits_by_id_or_node() {
    let calls = Calls::default();
    let manager = manager(&calls, None).await;
    manager.deploy(event_workflow("orders")).await.unwrap();

    let waiter_id = manager.active_waiters()[0].id.clone();
    assert!(manager.cancel_event_wait(&waiter_id));
    assert!(!manager.cancel_event_wait(&waiter_id));

    // the trigger loop ends once its waiter is cancelled
    assert_eq!(manager.cancel_event_wait_for_node("orders"), 0);
    assert_eq!(manager.dispatch_event("order.created", &json!({ "total": 5 })), 0);
}

#[tokio::test]
async fn failed_redeploy_keeps_the_previous_deployment() {
    let storage = DeploymentStorage::in_memory().await.unwrap();
    let calls = Calls::default();
    let manager = manager(&calls, Some(storage.clone())).await;
    let original = event_workflow("orders");
    manager.deploy(original.clone()).await.unwrap();

    let mut broken = event_workflow("orders");
    broken.nodes.push(Node::new("tick", "cronTrigger", json!({ "schedule": "whenever" })));
    broken.edges.push(Edge::new("tick", "record"));
    assert!(matches!(
        manager.deploy(broken).await,
        Err(EngineError::TriggerConfig { .. })
    ));

    let mut unknown_source = event_workflow("orders");
    unknown_source.nodes.push(Node::new("inbox", "pollTrigger", json!({ "source": "nowhere" })));
    unknown_source.edges.push(Edge::new("inbox", "record"));
    assert!(matches!(
        manager.deploy(unknown_source).await,
        Err(EngineError::TriggerConfig { .. })
    ));

    // memory and storage both still describe the original definition
    let status = manager.get_status("orders").await.unwrap();
    assert_eq!(status.triggers.len(), 1);
    assert_eq!(storage.get("orders").await.unwrap(), Some(original));
    assert_eq!(manager.active_waiters().len(), 1);
    assert_eq!(manager.dispatch_event("order.created", &json!({ "total": 3 })), 1);
    eventually(|| calls.get("echo") == 1).await;
}

#[tokio::test]
async fn deployed_run_reports_its_terminal_status_to_subscribers() {
    let calls = Calls::default();
    let sink = BroadcastSink::new(64);
    let mut events = sink.subscribe();
    let engine = engine_on(
        &calls,
        Arc::new(TieredCache::in_memory(cache_config())),
        Arc::new(sink.clone()),
    );
    let manager = DeploymentManager::new(engine, PollSources::new(), None).await.unwrap();
    manager.deploy(event_workflow("orders")).await.unwrap();
    assert_eq!(manager.dispatch_event("order.created", &json!({ "total": 5 })), 1);

    let terminal = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            match events.recv().await.unwrap() {
                StatusEvent::Run { workflow_id, status, .. } if status.is_terminal() => {
                    return (workflow_id, status);
                }
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(terminal, ("orders".to_string(), RunStatus::Success));
    assert_eq!(calls.get("echo"), 1);
}
