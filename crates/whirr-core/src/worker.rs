// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The worker loop: pull a job, execute it, store the result, wake waiters.
//!
//! Workers are stateless; every mutation below is CAS-guarded and the queue
//! is durable, so a worker that dies mid-turn leaves a consistent store and a
//! fresh worker resumes where it left off. A task body is NOT skipped when
//! its value already exists; the duplicate result is discarded at
//! `set_value`, which is what bounds a parent to at most one execution per
//! completion event.

use std::sync::atomic::Ordering;

use futures::FutureExt;
use tracing::{debug, info, instrument};

use crate::call::Job;
use crate::engine::Engine;
use crate::error::{Error, QueueError, Result};
use crate::task::{Outcome, TaskContext};

impl Engine {
    /// Run the worker loop until the queue closes or an error escapes.
    ///
    /// One worker per engine instance: a second concurrent call fails with
    /// [`Error::WorkerAlreadyRunning`]. The slot frees when the loop exits,
    /// so sequential runs on one engine are fine. Run more engine processes
    /// for parallelism.
    pub async fn work(&self) -> Result<()> {
        if self
            .worker_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::WorkerAlreadyRunning);
        }
        let _slot = WorkerSlot(self);
        // Fail fast on a missing setup before the first poll.
        self.backends()?;

        info!("worker started");
        loop {
            let message = match self.backends()?.queue.get_message().await {
                Ok(message) => message,
                Err(QueueError::Empty) | Err(QueueError::PopTimeout) => continue,
                Err(QueueError::Closed) => {
                    info!("queue closed, worker exiting");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            self.step(&message.body).await?;
        }
    }

    /// Execute one queued job.
    #[instrument(skip(self), fields(job = %body))]
    async fn step(&self, body: &str) -> Result<()> {
        let job = Job::parse(body)?;
        let backends = self.backends()?;
        let (task_name, payload) = backends.memory.get_call_bytes(&job.memo_key).await?;
        let registry = self.registry();
        let task = registry
            .get(&task_name)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound {
                name: task_name.clone(),
            })?;

        let ctx = TaskContext::worker(registry, backends.memory.clone());
        let outcome = backends
            .memory
            .codec()
            .invoke_task(&job.memo_key, &task, &payload, ctx)
            .await?;

        match outcome {
            Outcome::Ready(bytes) => {
                match backends.memory.set_value(&job.memo_key, &bytes).await {
                    Ok(()) => {}
                    Err(Error::ValueAlreadyExists { .. }) => {
                        // A concurrent worker ran the same call; its value
                        // stands and ours is discarded.
                        debug!(memo_key = %job.memo_key, "discarding duplicate result");
                    }
                    Err(e) => return Err(e),
                }
                backends
                    .memory
                    .with_pending_returns_remove(&job.memo_key, |parents| {
                        async move {
                            for parent in parents {
                                let parent = Job::parse(&parent)?;
                                self.put_job(&parent.memo_key, &parent.root_id).await?;
                            }
                            Ok(())
                        }
                        .boxed()
                    })
                    .await?;
            }
            Outcome::Pending(calls) => {
                debug!(memo_key = %job.memo_key, children = calls.len(), "task deferred");
                for call in &calls {
                    self.schedule_call_nested(call, &job.root_id, body).await?;
                }
            }
        }
        Ok(())
    }
}

/// Frees the engine's worker slot when the loop exits, however it exits.
struct WorkerSlot<'a>(&'a Engine);

impl Drop for WorkerSlot<'_> {
    fn drop(&mut self) {
        self.0.worker_active.store(false, Ordering::Release);
    }
}
