// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call identity and the queue-message grammar.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A single logical invocation: a task name and its arguments, identified by
/// a memo key derived from both.
///
/// Two calls with equal memo keys are the same call. This is the
/// memoization identity, so equality compares memo keys only.
#[derive(Debug, Clone)]
pub struct Call {
    /// Registered name of the task.
    pub task_name: String,
    /// Arguments as a JSON value.
    pub args: Value,
    /// Deterministic identity derived by the codec.
    pub memo_key: String,
}

impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        self.memo_key == other.memo_key
    }
}

impl Eq for Call {}

/// Mint a fresh root workflow identifier: 128 random bits rendered as
/// base64-url without padding. Never contains `/`, which the job message
/// grammar depends on.
pub fn new_root_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

/// A queue message: a memo key scoped to the root workflow that is paying
/// for its execution, rendered `rootId/memoKey`.
///
/// Parsing splits on the FIRST `/`. Root ids cannot contain `/`, so a memo
/// key containing one still round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// The root workflow this job is charged to.
    pub root_id: String,
    /// Memo key of the call to execute.
    pub memo_key: String,
}

impl Job {
    /// Build a job message.
    pub fn new(root_id: impl Into<String>, memo_key: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            memo_key: memo_key.into(),
        }
    }

    /// Parse a message body. A body without both halves is a dead message.
    pub fn parse(body: &str) -> Result<Self> {
        let (root_id, memo_key) = body.split_once('/').ok_or_else(|| Error::MalformedMessage {
            body: body.to_string(),
        })?;
        if root_id.is_empty() || memo_key.is_empty() {
            return Err(Error::MalformedMessage {
                body: body.to_string(),
            });
        }
        Ok(Self::new(root_id, memo_key))
    }

    /// Render the message body.
    pub fn encode(&self) -> String {
        format!("{}/{}", self.root_id, self.memo_key)
    }
}
