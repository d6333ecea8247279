// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine: task registration, scheduling, and client-side reads.
//!
//! Lifecycle: register tasks, attach backends with [`Engine::setup`], then
//! either schedule workflows as a client or enter the worker loop (see
//! `worker.rs`). Registration and local invocation work without backends;
//! everything durable requires them.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::call::{new_root_id, Call, Job};
use crate::codec::Codec;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::queue::Queue;
use crate::store::{Cache, Store};
use crate::task::{Outcome, Task, TaskContext, TaskFn, TaskRegistry};

pub(crate) struct Backends {
    pub(crate) queue: Arc<dyn Queue>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) memory: Arc<Memory>,
}

/// The execution engine.
pub struct Engine {
    pub(crate) config: EngineConfig,
    // Copy-on-write: registration swaps the Arc, contexts hold cheap
    // snapshots for the duration of a task run.
    registry: RwLock<Arc<TaskRegistry>>,
    pub(crate) backends: Option<Backends>,
    pub(crate) worker_active: AtomicBool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    /// Create an engine with the given configuration and no backends.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(Arc::new(TaskRegistry::new())),
            backends: None,
            worker_active: AtomicBool::new(false),
        }
    }

    /// Register a task handler under `name`.
    ///
    /// Handlers take a [`TaskContext`] and JSON arguments, and resolve to an
    /// [`Outcome`]: `Ready` with the return value, or `Pending` with the
    /// child calls still missing.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Outcome<Value>>> + Send + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidTaskName {
                reason: "empty name".to_string(),
            });
        }
        let handler: TaskFn = Arc::new(move |ctx, args| handler(ctx, args).boxed());
        let mut guard = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.contains_key(&name) {
            return Err(Error::DuplicateTask { name });
        }
        let mut registry = (**guard).clone();
        registry.insert(name.clone(), Task::new(name, handler));
        *guard = Arc::new(registry);
        Ok(())
    }

    /// Attach the durable backends: job queue, record store, counter cache,
    /// and codec. Required before scheduling, reading, or working.
    pub fn setup(
        &mut self,
        queue: Arc<dyn Queue>,
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        codec: Arc<dyn Codec>,
    ) {
        let memory = Arc::new(Memory::new(store, codec, self.config.cas_retry_limit));
        self.backends = Some(Backends {
            queue,
            cache,
            memory,
        });
    }

    pub(crate) fn backends(&self) -> Result<&Backends> {
        self.backends.as_ref().ok_or(Error::NotSetup)
    }

    pub(crate) fn registry(&self) -> Arc<TaskRegistry> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start a new root workflow.
    ///
    /// Short-circuits when the call record already exists: the workflow is
    /// in flight or complete, and its result is reachable through
    /// [`Engine::read`]. Otherwise persists the record, mints a root id, and
    /// enqueues the first job.
    pub async fn schedule<A>(&self, task_name: &str, args: &A) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        let backends = self.backends()?;
        if !self.registry().contains_key(task_name) {
            return Err(Error::TaskNotFound {
                name: task_name.to_string(),
            });
        }
        let args = serde_json::to_value(args)?;
        let call = backends.memory.make_call(task_name, &args)?;
        if backends.memory.has_call(&call).await? {
            debug!(memo_key = %call.memo_key, "call already scheduled, skipping");
            return Ok(());
        }
        backends.memory.set_call(&call).await?;
        let root_id = new_root_id();
        info!(task = task_name, root_id = %root_id, "scheduling root workflow");
        self.put_job(&call.memo_key, &root_id).await
    }

    /// Enqueue one job, charging the root workflow's spawn budget.
    pub(crate) async fn put_job(&self, memo_key: &str, root_id: &str) -> Result<()> {
        let backends = self.backends()?;
        let count = backends.cache.incr(&format!("count/{root_id}")).await?;
        if count > self.config.spawn_limit {
            return Err(Error::SpawnLimit {
                root_id: root_id.to_string(),
                limit: self.config.spawn_limit,
            });
        }
        backends
            .queue
            .put(&Job::new(root_id, memo_key).encode())
            .await?;
        Ok(())
    }

    /// Persist a child call and register its parent as a waiter. The first
    /// waiter also enqueues the child.
    pub(crate) async fn schedule_call_nested(
        &self,
        call: &Call,
        root_id: &str,
        parent_key: &str,
    ) -> Result<()> {
        let backends = self.backends()?;
        backends.memory.set_call(call).await?;
        let created = backends
            .memory
            .add_pending_return(&call.memo_key, parent_key, || {
                self.put_job(&call.memo_key, root_id).boxed()
            })
            .await?;
        // A waiter that registered after the child completed and drained its
        // record would otherwise never be woken.
        if created && backends.memory.has_value(&call.memo_key).await? {
            let parent = Job::parse(parent_key)?;
            debug!(child = %call.memo_key, "child already complete, re-enqueueing parent");
            self.put_job(&parent.memo_key, &parent.root_id).await?;
        }
        Ok(())
    }

    /// Read the memoized result of a completed call.
    pub async fn read<A, R>(&self, task_name: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let backends = self.backends()?;
        let args = serde_json::to_value(args)?;
        let call = backends.memory.make_call(task_name, &args)?;
        let bytes = backends
            .memory
            .get_value(&call.memo_key)
            .await?
            .ok_or(Error::ValueNotFound {
                memo_key: call.memo_key,
            })?;
        let value = backends.memory.codec().decode_return(&bytes)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run a task outside worker context: the handler executes directly, as
    /// do any tasks it invokes, with no store or queue I/O. Works without
    /// backends.
    pub async fn call_local<A, R>(&self, task_name: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let registry = self.registry();
        let task = registry
            .get(task_name)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound {
                name: task_name.to_string(),
            })?;
        let ctx = TaskContext::local(registry);
        match task.run(ctx, serde_json::to_value(args)?).await? {
            Outcome::Ready(value) => Ok(serde_json::from_value(value)?),
            Outcome::Pending(_) => Err(Error::Internal(
                "task deferred outside worker context".to_string(),
            )),
        }
    }
}
