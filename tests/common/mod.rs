#![allow(dead_code)]

use flowloom::cache::TieredCache;
use flowloom::config::{CacheConfig, EngineConfig};
use flowloom::error::NodeError;
use flowloom::runtime::events::{NoopSink, StatusSink};
use flowloom::runtime::nodes::builtin_registry;
use flowloom::runtime::run::RunRecord;
use flowloom::{EventWaiter, ExecutionEngine, NodeRegistry};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn cache_config() -> CacheConfig {
    CacheConfig {
        redis_url: None,
        default_ttl_secs: 300,
        lock_ttl_secs: 10,
        lock_wait_ms: 2_000,
        lock_poll_ms: 10,
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        max_concurrency: 16,
        heartbeat_interval_secs: 1,
        heartbeat_stale_secs: 30,
        reaper_interval_secs: 1,
        run_retention_secs: 3_600,
        default_poll_interval_secs: 1,
        poll_queue_capacity: 16,
        event_buffer: 64,
    }
}

/// Per-kind invocation counters shared with the registered handlers
#[derive(Clone, Default)]
pub struct Calls {
    counts: Arc<parking_lot::Mutex<HashMap<String, Arc<AtomicUsize>>>>,
}

impl Calls {
    pub fn counter(&self, kind: &str) -> Arc<AtomicUsize> {
        Arc::clone(self.counts.lock().entry(kind.to_string()).or_default())
    }

    pub fn get(&self, kind: &str) -> usize {
        self.counter(kind).load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.counts.lock().values().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

/// Builtins plus test kinds:
/// - `echo`: returns its merged input
/// - `tag`: returns `{ "tag": params.tag, "input": merged input }`
/// - `fail`: always fails with "boom"
/// - `slow`: sleeps `params.delay_ms`, then returns `{ "value": params.value }`
/// - `route`: returns `{ "route": params.route }`
pub fn registry(calls: &Calls) -> NodeRegistry {
    let mut registry = builtin_registry();

    let counter = calls.counter("echo");
    registry.register_fn("echo", move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(ctx.merged_input()) }
    });

    let counter = calls.counter("tag");
    registry.register_fn("tag", move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            Ok(json!({
                "tag": ctx.params().get("tag").cloned().unwrap_or(Value::Null),
                "input": ctx.merged_input(),
            }))
        }
    });

    let counter = calls.counter("fail");
    registry.register_fn("fail", move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(NodeError::failed("boom")) }
    });

    let counter = calls.counter("slow");
    registry.register_fn("slow", move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            let delay = ctx.node().param_u64("delay_ms").unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!({ "value": ctx.params().get("value").cloned().unwrap_or(Value::Null) }))
        }
    });

    let counter = calls.counter("route");
    registry.register_fn("route", move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(json!({ "route": ctx.params().get("route").cloned().unwrap_or(Value::Null) })) }
    });

    registry
}

pub fn engine(calls: &Calls) -> Arc<ExecutionEngine> {
    engine_on(calls, Arc::new(TieredCache::in_memory(cache_config())), Arc::new(NoopSink))
}

pub fn engine_on(calls: &Calls, cache: Arc<TieredCache>, sink: Arc<dyn StatusSink>) -> Arc<ExecutionEngine> {
    Arc::new(ExecutionEngine::new(
        registry(calls),
        cache,
        Arc::new(EventWaiter::new()),
        sink,
        engine_config(),
    ))
}

/// Poll the run registry until the run is terminal
pub async fn wait_terminal(engine: &ExecutionEngine, run_id: &str) -> RunRecord {
    for _ in 0..500 {
        if let Some(record) = engine.run_status(run_id) {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} did not finish", run_id);
}

/// Poll until `check` holds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
