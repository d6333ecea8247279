// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! # whirr-core
//!
//! Durable execution engine for recursive workflows. Task handlers may invoke
//! one another (including themselves) and fan in results; the engine
//! persists every call, memoizes its result, and schedules continuations
//! across any number of stateless workers. All shared state lives in a
//! compare-and-swap key-value store and a point-to-point queue, so a workflow
//! survives process restarts and machine failures.
//!
//! # How it runs
//!
//! A client schedules a root call; a worker dequeues it and runs the handler.
//! Inside a handler, invoking another task reads that call's memoized value:
//! present means the handler continues, absent means the handler returns
//! [`Outcome::Pending`] naming the missing calls. The worker registers the
//! parent as a waiter on each child (the first waiter enqueues the child) and
//! moves on. When a call completes, its value is stored once and every waiting
//! parent is re-enqueued; a re-run parent finds its children cached and either
//! finishes or defers on the next round. Identical calls collapse to one
//! execution through their shared memo key.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use whirr_core::{ready, Engine, EngineConfig, JsonCodec, Outcome};
//!
//! let mut engine = Engine::new(EngineConfig::default());
//! engine.register("fib", |ctx, args| async move {
//!     let n = args.as_u64().unwrap_or(0);
//!     if n < 2 {
//!         return Ok(Outcome::Ready(json!(n)));
//!     }
//!     let parts = ready!(ctx.map("fib", vec![json!(n - 1), json!(n - 2)]).await?);
//!     let sum: u64 = parts.iter().filter_map(|v| v.as_u64()).sum();
//!     Ok(Outcome::Ready(json!(sum)))
//! })?;
//!
//! engine.setup(queue, store, cache, Arc::new(JsonCodec::new()));
//! engine.schedule("fib", &[10]).await?;
//! engine.work().await?; // until the queue closes
//! let result: u64 = engine.read("fib", &[10]).await?;
//! ```
//!
//! # What the engine does not do
//!
//! There is no task-level retry: a handler error aborts the worker's turn and
//! surfaces from [`Engine::work`], leaving durable state intact. Bodies may
//! execute more than once under contention; only the first stored result
//! counts. Completion has no push notification: a workflow is complete when
//! its root value exists.

mod call;
mod codec;
mod config;
mod engine;
mod error;
mod memory;
mod queue;
mod store;
mod task;
mod worker;

pub use call::{new_root_id, Call, Job};
pub use codec::{Codec, JsonCodec};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, QueueError, Result, StoreError};
pub use memory::Memory;
pub use queue::{Message, Queue, QueueInfo, QueueResult};
pub use store::{Cache, MemKey, Namespace, Store, StoreResult};
pub use task::{Outcome, Task, TaskContext, TaskFn, TaskFuture};
