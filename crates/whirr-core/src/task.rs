// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task handlers, the execution context, and the deferral mechanism.
//!
//! A task invocation inside a workflow either has its memoized value already,
//! or names the calls that must complete first. That second case is ordinary
//! control-flow data, [`Outcome::Pending`], which the worker turns into
//! scheduling work. Handlers receive an explicit [`TaskContext`] and dispatch
//! on it: in worker mode, invocations consult the value store; in local mode
//! they run the registered handler directly with no store or queue I/O, which
//! is what makes handlers unit-testable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::call::Call;
use crate::error::{Error, Result};
use crate::memory::Memory;

/// The result of invoking a task from inside a workflow.
///
/// Mirrors `std::task::Poll`: `Ready` carries the value, `Pending` carries
/// the calls whose completion would unblock it.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The call has completed and this is its (decoded) value.
    Ready(T),
    /// The listed child calls have no memoized value yet.
    Pending(Vec<Call>),
}

impl<T> Outcome<T> {
    /// Whether this is `Ready`.
    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready(_))
    }

    /// Whether this is `Pending`.
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending(_))
    }

    /// Map the ready value, passing pending calls through.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ready(value) => Outcome::Ready(f(value)),
            Outcome::Pending(calls) => Outcome::Pending(calls),
        }
    }
}

/// Unwrap [`Outcome::Ready`], or return early from the surrounding handler
/// with the pending calls. The deferral analogue of `std::task::ready!`.
///
/// ```ignore
/// let n = ready!(ctx.call::<_, i64>("fib", &(a - 1)).await?);
/// ```
#[macro_export]
macro_rules! ready {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ready(value) => value,
            $crate::Outcome::Pending(calls) => return Ok($crate::Outcome::Pending(calls)),
        }
    };
}

/// Boxed future returned by task handlers.
pub type TaskFuture = BoxFuture<'static, Result<Outcome<Value>>>;

/// Type-erased task handler: context plus JSON arguments in, outcome out.
pub type TaskFn = Arc<dyn Fn(TaskContext, Value) -> TaskFuture + Send + Sync>;

/// A registered task: a name bound to its handler.
#[derive(Clone)]
pub struct Task {
    /// Registered name.
    pub name: String,
    handler: TaskFn,
}

impl Task {
    pub(crate) fn new(name: impl Into<String>, handler: TaskFn) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    /// Run the handler.
    pub fn run(&self, ctx: TaskContext, args: Value) -> TaskFuture {
        (self.handler)(ctx, args)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

pub(crate) type TaskRegistry = HashMap<String, Task>;

/// Execution context handed to every task handler.
///
/// Cheap to clone; handlers pass it to nested invocations.
#[derive(Clone)]
pub struct TaskContext {
    registry: Arc<TaskRegistry>,
    mode: Mode,
}

#[derive(Clone)]
enum Mode {
    Local,
    Worker { memory: Arc<Memory> },
}

impl TaskContext {
    pub(crate) fn local(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            mode: Mode::Local,
        }
    }

    pub(crate) fn worker(registry: Arc<TaskRegistry>, memory: Arc<Memory>) -> Self {
        Self {
            registry,
            mode: Mode::Worker { memory },
        }
    }

    /// Whether this context is executing under a worker.
    pub fn is_worker(&self) -> bool {
        matches!(self.mode, Mode::Worker { .. })
    }

    /// Invoke a task with JSON arguments.
    ///
    /// Worker mode reads the child's memoized value; a miss is
    /// [`Outcome::Pending`] carrying the child call. Local mode runs the
    /// registered handler directly.
    pub async fn invoke(&self, task_name: &str, args: Value) -> Result<Outcome<Value>> {
        let task = self
            .registry
            .get(task_name)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound {
                name: task_name.to_string(),
            })?;
        match &self.mode {
            Mode::Local => task.run(self.clone(), args).await,
            Mode::Worker { memory } => {
                let call = memory.make_call(task_name, &args)?;
                match memory.get_value(&call.memo_key).await? {
                    Some(bytes) => Ok(Outcome::Ready(memory.codec().decode_return(&bytes)?)),
                    None => Ok(Outcome::Pending(vec![call])),
                }
            }
        }
    }

    /// Typed invoke: serialize `args`, decode a ready result into `R`.
    pub async fn call<A, R>(&self, task_name: &str, args: &A) -> Result<Outcome<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        match self.invoke(task_name, serde_json::to_value(args)?).await? {
            Outcome::Ready(value) => Ok(Outcome::Ready(serde_json::from_value(value)?)),
            Outcome::Pending(calls) => Ok(Outcome::Pending(calls)),
        }
    }

    /// Fan-in: invoke every `(task, args)` pair, collecting ready results in
    /// order.
    ///
    /// Every invocation is attempted even after a miss, so a single parent
    /// execution discovers ALL of its missing children and the worker
    /// schedules the whole round at once, rather than one child per re-run.
    pub async fn gather<I, S>(&self, invocations: I) -> Result<Outcome<Vec<Value>>>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        let mut ready = Vec::new();
        let mut pending = Vec::new();
        for (name, args) in invocations {
            match self.invoke(name.as_ref(), args).await? {
                Outcome::Ready(value) => ready.push(value),
                Outcome::Pending(calls) => pending.extend(calls),
            }
        }
        if pending.is_empty() {
            Ok(Outcome::Ready(ready))
        } else {
            Ok(Outcome::Pending(pending))
        }
    }

    /// Invoke the same task once per argument set.
    pub async fn map<I>(&self, task_name: &str, args_list: I) -> Result<Outcome<Vec<Value>>>
    where
        I: IntoIterator<Item = Value>,
    {
        self.gather(args_list.into_iter().map(|args| (task_name, args)))
            .await
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Mode::Local => "local",
            Mode::Worker { .. } => "worker",
        };
        f.debug_struct("TaskContext").field("mode", &mode).finish()
    }
}
