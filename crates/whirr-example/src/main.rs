// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recursive fibonacci as a durable workflow, embedded in one process.
//!
//! Every `fib(n)` below is a separate durable call: persisted, memoized, and
//! scheduled through the queue, so the naive double recursion costs a linear
//! number of executions. Usage: `whirr-example [n]` (default 20).

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::info;

use whirr_core::{ready, Engine, EngineConfig, JsonCodec, Outcome, Queue, TaskContext};
use whirr_test_harness::{MemoryQueue, MemoryStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("whirr_core=info".parse()?)
                .add_directive("whirr_example=info".parse()?),
        )
        .init();

    let n: u64 = match std::env::args().nth(1) {
        Some(raw) => raw.parse()?,
        None => 20,
    };

    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());

    let mut engine = Engine::new(EngineConfig::from_env()?);

    engine.register("fib", |ctx: TaskContext, args: Value| async move {
        let n = args.as_u64().unwrap_or(0);
        if n < 2 {
            return Ok(Outcome::Ready(json!(n)));
        }
        let parts = ready!(ctx.map("fib", vec![json!(n - 2), json!(n - 1)]).await?);
        let sum: u64 = parts.iter().filter_map(|v| v.as_u64()).sum();
        Ok(Outcome::Ready(json!(sum)))
    })?;

    // Driver task: computes fib(n), then shuts the demo down by closing the
    // queue, since the engine itself has no completion signal.
    {
        let queue = queue.clone();
        engine.register("fib_and_stop", move |ctx: TaskContext, args: Value| {
            let queue = queue.clone();
            async move {
                let result = ready!(ctx.call::<_, u64>("fib", &args).await?);
                info!(result, "workflow complete");
                queue.close().await;
                Ok(Outcome::Ready(json!(result)))
            }
        })?;
    }

    engine.setup(
        queue.clone(),
        store.clone(),
        store.clone(),
        Arc::new(JsonCodec::new()),
    );

    engine.schedule("fib_and_stop", &n).await?;
    engine.work().await?;

    let result: u64 = engine.read("fib_and_stop", &n).await?;
    let info = queue.get_info().await?;
    println!("fib({n}) = {result}");
    info!(
        stored_keys = store.keys().await.len(),
        queued = info.num_messages,
        "engine state at shutdown"
    );
    Ok(())
}
