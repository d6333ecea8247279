// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end engine tests on the in-memory backends.
//!
//! Workflows here drive a single worker to completion by closing the queue
//! from inside a task body, since the engine itself has no completion signal. The
//! call-count assertions are the protocol's contract: how often a body runs
//! under deferral, wakeup, and memoization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use whirr_core::{
    ready, Codec, Engine, EngineConfig, Error, JsonCodec, MemKey, Memory, Outcome, Queue, Store,
    StoreError, StoreResult, TaskContext,
};
use whirr_test_harness::{MemoryQueue, MemoryStore};

type Counts = Arc<Mutex<HashMap<i64, u32>>>;

fn backends() -> (Arc<MemoryStore>, Arc<MemoryQueue>) {
    (
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryQueue::with_recv_wait(Duration::from_millis(50))),
    )
}

fn bump(counts: &Counts, key: i64) -> u32 {
    let mut counts = counts.lock().unwrap();
    let count = counts.entry(key).or_insert(0);
    *count += 1;
    *count
}

fn snapshot(counts: &Counts) -> HashMap<i64, u32> {
    counts.lock().unwrap().clone()
}

#[tokio::test]
async fn test_triangular_sum_runs_locally_without_backends() {
    let engine = Engine::default();
    engine
        .register("triangular_sum", |ctx: TaskContext, args: Value| async move {
            let n = args.as_i64().unwrap();
            if n == 0 {
                return Ok(Outcome::Ready(json!(0)));
            }
            let rest = ready!(ctx.call::<_, i64>("triangular_sum", &(n - 1)).await?);
            Ok(Outcome::Ready(json!(n + rest)))
        })
        .unwrap();

    let result: i64 = engine.call_local("triangular_sum", &3).await.unwrap();
    assert_eq!(result, 6);
}

#[tokio::test]
async fn test_local_invocation_performs_no_io() {
    let (store, queue) = backends();
    let mut engine = Engine::default();
    engine
        .register("triangular_sum", |ctx: TaskContext, args: Value| async move {
            let n = args.as_i64().unwrap();
            if n == 0 {
                return Ok(Outcome::Ready(json!(0)));
            }
            let rest = ready!(ctx.call::<_, i64>("triangular_sum", &(n - 1)).await?);
            Ok(Outcome::Ready(json!(n + rest)))
        })
        .unwrap();
    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );

    let result: i64 = engine.call_local("triangular_sum", &3).await.unwrap();
    assert_eq!(result, 6);
    assert!(store.keys().await.is_empty());
    assert!(store.counters().await.is_empty());
    assert_eq!(queue.get_info().await.unwrap().num_messages, 0);
}

#[tokio::test]
async fn test_stop_when_empty_call_counts() {
    let (store, queue) = backends();
    let mut engine = Engine::default();
    let pre: Counts = Counts::default();
    let post: Counts = Counts::default();

    {
        let pre = pre.clone();
        let post = post.clone();
        let queue = queue.clone();
        engine
            .register("foo", move |ctx: TaskContext, args: Value| {
                let pre = pre.clone();
                let post = post.clone();
                let queue = queue.clone();
                async move {
                    let a = args.as_i64().unwrap();
                    bump(&pre, a);
                    if a == 0 {
                        return Ok(Outcome::Ready(json!(0)));
                    }
                    let res = ready!(ctx.call::<_, i64>("foo", &(a - 1)).await?);
                    bump(&post, a);
                    if a == 3 {
                        queue.close().await;
                    }
                    Ok(Outcome::Ready(json!(res)))
                }
            })
            .unwrap();
    }

    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );
    engine.schedule("foo", &3).await.unwrap();
    engine.work().await.unwrap();

    // The root pre-runs once and re-runs after each of its three descendants
    // completes; intermediates run once to defer and once after wakeup; the
    // leaf runs once and never reaches its post path.
    assert_eq!(
        snapshot(&pre),
        HashMap::from([(0, 1), (1, 2), (2, 2), (3, 2)])
    );
    assert_eq!(snapshot(&post), HashMap::from([(1, 1), (2, 1), (3, 1)]));

    // Quiescent invariants: one call and one value record per memo key, no
    // pending returns left behind, and the spawn counter equals the exact
    // number of enqueues (1 root + 3 children + 3 parent wakeups).
    let keys = store.keys().await;
    assert_eq!(keys.iter().filter(|k| k.starts_with("call/")).count(), 4);
    assert_eq!(keys.iter().filter(|k| k.starts_with("value/")).count(), 4);
    assert!(!keys.iter().any(|k| k.starts_with("pending_returns/")));
    let counters = store.counters().await;
    assert_eq!(counters.len(), 1);
    assert_eq!(counters.values().copied().next(), Some(7));

    let result: i64 = engine.read("foo", &3).await.unwrap();
    assert_eq!(result, 0);
}

#[tokio::test]
async fn test_identical_fanout_children_collapse_to_one_execution() {
    let (store, queue) = backends();
    let mut engine = Engine::default();
    let calls: Counts = Counts::default();

    {
        let calls = calls.clone();
        let queue = queue.clone();
        engine
            .register("foo", move |ctx: TaskContext, args: Value| {
                let calls = calls.clone();
                let queue = queue.clone();
                async move {
                    let a = args.as_i64().unwrap();
                    bump(&calls, a);
                    if a == 0 {
                        return Ok(Outcome::Ready(json!(0)));
                    }
                    // Fifty identical children share one memo key and thus
                    // one execution.
                    let parts = ready!(ctx.map("foo", vec![json!(a - 1); 50]).await?);
                    let sum: i64 = parts.iter().map(|v| v.as_i64().unwrap()).sum();
                    if a == 3 {
                        queue.close().await;
                    }
                    Ok(Outcome::Ready(json!(sum)))
                }
            })
            .unwrap();
    }

    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );
    engine.schedule("foo", &3).await.unwrap();
    engine.work().await.unwrap();

    assert_eq!(
        snapshot(&calls),
        HashMap::from([(0, 1), (1, 2), (2, 2), (3, 2)])
    );
}

#[tokio::test]
async fn test_distinct_children_wake_parent_once_each() {
    let (store, queue) = backends();
    let mut engine = Engine::default();
    let ones = Arc::new(AtomicU32::new(0));
    let foos = Arc::new(AtomicU32::new(0));

    {
        let ones = ones.clone();
        engine
            .register("one", move |_ctx: TaskContext, _args: Value| {
                let ones = ones.clone();
                async move {
                    ones.fetch_add(1, Ordering::SeqCst);
                    Ok(Outcome::Ready(json!(1)))
                }
            })
            .unwrap();
    }
    {
        let foos = foos.clone();
        let queue = queue.clone();
        engine
            .register("foo", move |ctx: TaskContext, args: Value| {
                let foos = foos.clone();
                let queue = queue.clone();
                async move {
                    let a = args.as_i64().unwrap();
                    let run = foos.fetch_add(1, Ordering::SeqCst) + 1;
                    let parts = ready!(ctx.map("one", (0..a).map(|i| json!(i))).await?);
                    let sum: i64 = parts.iter().map(|v| v.as_i64().unwrap()).sum();
                    // One initial run plus one wakeup per distinct child.
                    if run == 1 + a as u32 {
                        queue.close().await;
                    }
                    Ok(Outcome::Ready(json!(sum)))
                }
            })
            .unwrap();
    }

    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );
    engine.schedule("foo", &50).await.unwrap();
    engine.work().await.unwrap();

    assert_eq!(ones.load(Ordering::SeqCst), 50);
    assert_eq!(foos.load(Ordering::SeqCst), 51);
    let result: i64 = engine.read("foo", &50).await.unwrap();
    assert_eq!(result, 50);
}

fn register_chain(engine: &Engine, execs: &Counts, queue: &Arc<MemoryQueue>, close_at: i64) {
    let execs = execs.clone();
    let queue = queue.clone();
    engine
        .register("chain", move |ctx: TaskContext, args: Value| {
            let execs = execs.clone();
            let queue = queue.clone();
            async move {
                let a = args.as_i64().unwrap();
                bump(&execs, a);
                if a == 0 {
                    return Ok(Outcome::Ready(json!(0)));
                }
                let res = ready!(ctx.call::<_, i64>("chain", &(a - 1)).await?);
                if a == close_at {
                    queue.close().await;
                }
                Ok(Outcome::Ready(json!(res)))
            }
        })
        .unwrap();
}

#[tokio::test]
async fn test_spawn_limit_aborts_deep_chain() {
    let limit = 25i64;
    let (store, queue) = backends();
    let mut engine = Engine::new(EngineConfig::new().with_spawn_limit(limit));
    let execs: Counts = Counts::default();
    register_chain(&engine, &execs, &queue, -1);

    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );
    engine.schedule("chain", &(limit + 3)).await.unwrap();

    let err = engine.work().await.unwrap_err();
    assert!(matches!(err, Error::SpawnLimit { limit: 25, .. }));
    // Each enqueue bought exactly one body execution before the budget ran
    // out.
    let total: u32 = execs.lock().unwrap().values().sum();
    assert_eq!(total as i64, limit);
}

#[tokio::test]
async fn test_spawn_limit_exact_budget_succeeds() {
    // Depth d costs 1 + 2d enqueues (root, d children, d wakeups); d = 12
    // lands exactly on a budget of 25.
    let limit = 25i64;
    let depth = 12i64;
    let (store, queue) = backends();
    let mut engine = Engine::new(EngineConfig::new().with_spawn_limit(limit));
    let execs: Counts = Counts::default();
    register_chain(&engine, &execs, &queue, depth);

    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );
    engine.schedule("chain", &depth).await.unwrap();
    engine.work().await.unwrap();

    let counters = store.counters().await;
    assert_eq!(counters.values().copied().next(), Some(limit));
    let result: i64 = engine.read("chain", &depth).await.unwrap();
    assert_eq!(result, 0);
}

#[tokio::test]
async fn test_oversized_identical_fanout_spawns_once() {
    let limit = 25i64;
    let fanout = (limit + 5) as usize;
    let (store, queue) = backends();
    let mut engine = Engine::new(EngineConfig::new().with_spawn_limit(limit));
    let sames = Arc::new(AtomicU32::new(0));

    {
        let sames = sames.clone();
        engine
            .register("same", move |_ctx: TaskContext, args: Value| {
                let sames = sames.clone();
                async move {
                    sames.fetch_add(1, Ordering::SeqCst);
                    Ok(Outcome::Ready(args))
                }
            })
            .unwrap();
    }
    {
        let queue = queue.clone();
        engine
            .register("fan", move |ctx: TaskContext, args: Value| {
                let queue = queue.clone();
                async move {
                    let n = args.as_u64().unwrap() as usize;
                    let parts = ready!(ctx.map("same", vec![json!(1); n]).await?);
                    let sum: i64 = parts.iter().map(|v| v.as_i64().unwrap()).sum();
                    queue.close().await;
                    Ok(Outcome::Ready(json!(sum)))
                }
            })
            .unwrap();
    }

    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );
    engine.schedule("fan", &fanout).await.unwrap();
    engine.work().await.unwrap();

    // Well past the spawn limit in fan-out width, but all copies share one
    // memo key: one child execution, three enqueues total.
    assert_eq!(sames.load(Ordering::SeqCst), 1);
    let result: i64 = engine.read("fan", &fanout).await.unwrap();
    assert_eq!(result, limit + 5);
}

#[tokio::test]
async fn test_work_on_closed_queue_exits_immediately() {
    let (store, queue) = backends();
    let mut engine = Engine::default();
    engine
        .register("noop", |_ctx: TaskContext, _args: Value| async move {
            Ok(Outcome::Ready(json!(null)))
        })
        .unwrap();
    engine.setup(
        queue.clone(),
        store.clone(),
        store,
        Arc::new(JsonCodec::new()),
    );
    queue.close().await;

    engine.work().await.unwrap();
    // The worker slot is released on exit; a sequential run is fine.
    engine.work().await.unwrap();
}

#[tokio::test]
async fn test_second_concurrent_worker_is_rejected() {
    let (store, queue) = backends();
    let mut engine = Engine::default();
    engine
        .register("noop", |_ctx: TaskContext, _args: Value| async move {
            Ok(Outcome::Ready(json!(null)))
        })
        .unwrap();
    engine.setup(
        queue.clone(),
        store.clone(),
        store,
        Arc::new(JsonCodec::new()),
    );

    let engine = Arc::new(engine);
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.work().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(
        engine.work().await,
        Err(Error::WorkerAlreadyRunning)
    ));

    queue.close().await;
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_schedule_short_circuits_on_existing_call() {
    let (store, queue) = backends();
    let mut engine = Engine::default();
    engine
        .register("noop", |_ctx: TaskContext, _args: Value| async move {
            Ok(Outcome::Ready(json!(null)))
        })
        .unwrap();
    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );

    engine.schedule("noop", &1).await.unwrap();
    engine.schedule("noop", &1).await.unwrap();

    // One message, one spawn charged: the second schedule was a no-op.
    assert_eq!(queue.get_info().await.unwrap().num_messages, 1);
    assert_eq!(store.counters().await.len(), 1);
}

#[tokio::test]
async fn test_worker_failure_leaves_state_recoverable() {
    let (store, queue) = backends();
    let mut engine = Engine::default();
    let booms: Counts = Counts::default();
    let bars: Counts = Counts::default();

    {
        let booms = booms.clone();
        engine
            .register("boom", move |ctx: TaskContext, args: Value| {
                let booms = booms.clone();
                async move {
                    let a = args.as_i64().unwrap();
                    bump(&booms, a);
                    if a == 0 {
                        return Err(Error::task("deliberate failure"));
                    }
                    let res = ready!(ctx.call::<_, i64>("boom", &(a - 1)).await?);
                    Ok(Outcome::Ready(json!(res)))
                }
            })
            .unwrap();
    }
    {
        let bars = bars.clone();
        let queue = queue.clone();
        engine
            .register("bar", move |ctx: TaskContext, args: Value| {
                let bars = bars.clone();
                let queue = queue.clone();
                async move {
                    let a = args.as_i64().unwrap();
                    bump(&bars, a);
                    if a == 0 {
                        return Ok(Outcome::Ready(json!(0)));
                    }
                    let res = ready!(ctx.call::<_, i64>("bar", &(a - 1)).await?);
                    if a == 2 {
                        queue.close().await;
                    }
                    Ok(Outcome::Ready(json!(res)))
                }
            })
            .unwrap();
    }

    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );

    engine.schedule("boom", &2).await.unwrap();
    let err = engine.work().await.unwrap_err();
    assert!(matches!(err, Error::Task(_)));

    // The failure aborted one turn; durable state is intact and a fresh
    // worker finishes unrelated workflows without re-running memoized bodies.
    engine.schedule("bar", &2).await.unwrap();
    engine.work().await.unwrap();

    assert_eq!(snapshot(&booms), HashMap::from([(0, 1), (1, 1), (2, 1)]));
    assert_eq!(snapshot(&bars), HashMap::from([(0, 1), (1, 2), (2, 2)]));
}

/// Store wrapper that hides one key from exactly one `get`, reproducing the
/// window where a parent reads a child's value as absent just before the
/// child completes and drains its waiters.
struct LateWaiterStore {
    inner: Arc<MemoryStore>,
    hide_once: Mutex<Option<String>>,
}

#[async_trait]
impl Store for LateWaiterStore {
    async fn has(&self, key: &MemKey) -> StoreResult<bool> {
        self.inner.has(key).await
    }

    async fn get(&self, key: &MemKey) -> StoreResult<Vec<u8>> {
        let hidden = {
            let mut hide_once = self.hide_once.lock().unwrap();
            if hide_once.as_deref() == Some(key.to_string().as_str()) {
                hide_once.take();
                true
            } else {
                false
            }
        };
        if hidden {
            return Err(StoreError::NotFound(key.to_string()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &MemKey, value: &[u8]) -> StoreResult<()> {
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &MemKey) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn set_new_value(&self, key: &MemKey, value: &[u8]) -> StoreResult<()> {
        self.inner.set_new_value(key, value).await
    }

    async fn compare_and_set(&self, key: &MemKey, value: &[u8], expected: &[u8]) -> StoreResult<()> {
        self.inner.compare_and_set(key, value, expected).await
    }

    async fn compare_and_delete(&self, key: &MemKey, expected: &[u8]) -> StoreResult<()> {
        self.inner.compare_and_delete(key, expected).await
    }
}

#[tokio::test]
async fn test_late_waiter_on_completed_child_is_not_stranded() {
    let (store, queue) = backends();
    let codec = JsonCodec::new();

    // Durable state of a child that completed and drained its waiters long
    // ago: call and value records exist, no pending-returns record does.
    let child_call = codec.create_call("child", &json!(1)).unwrap();
    let memory = Memory::new(store.clone(), Arc::new(codec), 100);
    memory.set_call(&child_call).await.unwrap();
    memory
        .set_value(&child_call.memo_key, &serde_json::to_vec(&json!(42)).unwrap())
        .await
        .unwrap();

    // The parent's next read of that value misses, once, so it defers on a
    // child that is in fact already complete.
    let racing_store = Arc::new(LateWaiterStore {
        inner: store.clone(),
        hide_once: Mutex::new(Some(MemKey::value(&child_call.memo_key).to_string())),
    });

    let mut engine = Engine::default();
    let child_runs = Arc::new(AtomicU32::new(0));
    let parent_runs = Arc::new(AtomicU32::new(0));

    {
        let child_runs = child_runs.clone();
        engine
            .register("child", move |_ctx: TaskContext, _args: Value| {
                let child_runs = child_runs.clone();
                async move {
                    child_runs.fetch_add(1, Ordering::SeqCst);
                    // Distinguishable from the memoized 42: this duplicate
                    // result must be discarded.
                    Ok(Outcome::Ready(json!(43)))
                }
            })
            .unwrap();
    }
    {
        let parent_runs = parent_runs.clone();
        let queue = queue.clone();
        engine
            .register("parent", move |ctx: TaskContext, args: Value| {
                let parent_runs = parent_runs.clone();
                let queue = queue.clone();
                async move {
                    parent_runs.fetch_add(1, Ordering::SeqCst);
                    let v = ready!(ctx.call::<_, i64>("child", &args).await?);
                    queue.close().await;
                    Ok(Outcome::Ready(json!(v)))
                }
            })
            .unwrap();
    }

    engine.setup(
        queue.clone(),
        racing_store,
        store.clone(),
        Arc::new(JsonCodec::new()),
    );
    engine.schedule("parent", &1).await.unwrap();
    engine.work().await.unwrap();

    // The parent registered a fresh waiter record on the completed child and
    // must have been re-enqueued directly by its own deferring turn, not
    // stranded. Four enqueues: the scheduled parent, the child re-enqueue by
    // the first waiter, the direct parent wakeup, and the redundant wakeup
    // from the re-executed child's drain.
    let counters = store.counters().await;
    assert_eq!(counters.len(), 1);
    assert_eq!(counters.values().copied().next(), Some(4));
    // The redundant drain wakeup arrived after the parent closed the queue.
    assert_eq!(queue.get_info().await.unwrap().num_messages, 1);

    assert_eq!(parent_runs.load(Ordering::SeqCst), 2);
    assert_eq!(child_runs.load(Ordering::SeqCst), 1);
    let parent_value: i64 = engine.read("parent", &1).await.unwrap();
    assert_eq!(parent_value, 42);
    let child_value: i64 = engine.read("child", &1).await.unwrap();
    assert_eq!(child_value, 42);
    assert!(!store
        .keys()
        .await
        .iter()
        .any(|k| k.starts_with("pending_returns/")));
}
