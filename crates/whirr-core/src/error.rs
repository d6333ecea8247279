// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the whirr engine.
//!
//! The engine distinguishes three families: misuse errors that are fatal at
//! the call site (`NotSetup`, `DuplicateTask`, `WorkerAlreadyRunning`),
//! transient conditions that are retried or absorbed by the protocol
//! (`StoreError::CompareMismatch`, `QueueError::Empty`,
//! `ValueAlreadyExists`), and everything else, which aborts the current
//! worker turn while leaving durable state consistent.
//!
//! Deferral is deliberately NOT represented here: a task that cannot finish
//! yet returns [`Outcome::Pending`](crate::Outcome), which is ordinary data.

use thiserror::Error;

/// Type alias for engine results.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An operation requiring backends was called before `setup()`.
    #[error("engine not set up: call setup() with backends first")]
    NotSetup,

    /// Configuration error (invalid environment variable).
    #[error("configuration error: {0}")]
    Config(String),

    /// A task was registered twice under the same name.
    #[error("task '{name}' is already registered")]
    DuplicateTask {
        /// The offending task name.
        name: String,
    },

    /// A task was registered under an unusable name.
    #[error("invalid task name: {reason}")]
    InvalidTaskName {
        /// Why the name was rejected.
        reason: String,
    },

    /// No task is registered under the requested name.
    #[error("no task registered under '{name}'")]
    TaskNotFound {
        /// The missing task name.
        name: String,
    },

    /// A client read of a call that has not completed.
    #[error("no value stored for memo key '{memo_key}'")]
    ValueNotFound {
        /// Memo key of the unfinished call.
        memo_key: String,
    },

    /// Two workers raced the same call; the later result is discarded.
    #[error("value already set for memo key '{memo_key}'")]
    ValueAlreadyExists {
        /// Memo key of the duplicated call.
        memo_key: String,
    },

    /// A CAS-guarded store transaction kept losing races past the retry
    /// budget. Almost certainly a broken `compare_and_set` in the backend.
    #[error("exceeded CAS retry limit ({limit}) on '{key}'")]
    CasRetryLimit {
        /// The contended store key.
        key: String,
        /// The configured retry budget.
        limit: u32,
    },

    /// The root workflow exceeded its enqueue budget.
    #[error("spawn limit of {limit} jobs exceeded for root '{root_id}'")]
    SpawnLimit {
        /// Root workflow identifier.
        root_id: String,
        /// The configured budget.
        limit: i64,
    },

    /// A second concurrent worker on the same engine instance.
    #[error("a worker is already running on this engine")]
    WorkerAlreadyRunning,

    /// A queue message that does not parse as `rootId/memoKey`.
    #[error("malformed queue message: '{body}'")]
    MalformedMessage {
        /// The raw message body.
        body: String,
    },

    /// A task handler failed. Aborts the worker turn; the workflow's durable
    /// state is untouched and a fresh worker can resume other work.
    #[error("task failed: {0}")]
    Task(String),

    /// Encoding or decoding of a call, value, or persisted record failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),

    /// Store backend error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Queue backend error.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl Error {
    /// Construct a user task failure.
    pub fn task(message: impl Into<String>) -> Self {
        Error::Task(message.into())
    }

    pub(crate) fn is_compare_mismatch(&self) -> bool {
        matches!(self, Error::Store(StoreError::CompareMismatch))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

/// Errors from a [`Store`](crate::Store) or [`Cache`](crate::Cache) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is absent.
    #[error("key not found: {0}")]
    NotFound(String),

    /// A conditional write observed a different current value. Transient:
    /// CAS-guarded operations retry on this.
    #[error("compare mismatch")]
    CompareMismatch,

    /// The backend itself failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors from a [`Queue`](crate::Queue) backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The bounded blocking receive elapsed with no message. Transient.
    #[error("queue is empty")]
    Empty,

    /// An adapter-level blocking pop timed out. Transient.
    #[error("queue pop timed out")]
    PopTimeout,

    /// The queue has been terminally closed. Workers exit cleanly.
    #[error("queue is closed")]
    Closed,

    /// The backend itself failed.
    #[error("queue backend error: {0}")]
    Backend(String),
}
