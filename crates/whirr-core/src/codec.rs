// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Argument and return-value codecs.
//!
//! A codec owns the translation between logical task arguments and the bytes
//! the engine persists, and, critically, derives each call's memo key. The
//! one hard requirement is determinism: given the same task name and
//! logically equal arguments, every process must derive byte-identical memo
//! keys, or memoization silently degrades into duplicated work.

use async_trait::async_trait;
use serde_json::Value;

use crate::call::Call;
use crate::error::Result;
use crate::task::{Outcome, Task, TaskContext};

/// Codec capability set.
#[async_trait]
pub trait Codec: Send + Sync {
    /// Derive a [`Call`], including its memo key, from a task name and
    /// arguments. Must be a pure function of both.
    fn create_call(&self, task_name: &str, args: &Value) -> Result<Call>;

    /// Encode a call's arguments to the payload persisted in its call record.
    fn encode_call(&self, call: &Call) -> Result<Vec<u8>>;

    /// Decode `payload`, run the task's handler in `ctx`, and encode the
    /// return value. A deferral outcome passes through unencoded.
    async fn invoke_task(
        &self,
        memo_key: &str,
        task: &Task,
        payload: &[u8],
        ctx: TaskContext,
    ) -> Result<Outcome<Vec<u8>>>;

    /// Decode a stored return value.
    fn decode_return(&self, payload: &[u8]) -> Result<Value>;
}

/// Default codec: canonical JSON.
///
/// The memo key is the JSON text of `[task_name, args]`. `serde_json` maps
/// iterate in sorted key order (the crate's map type is backed by a
/// `BTreeMap` unless its `preserve_order` feature is enabled, which this crate
/// does not enable it), and numbers normalize when parsed into [`Value`], so
/// logically equal arguments yield identical keys across processes
/// regardless of how their members were ordered at the call site.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create the codec.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Codec for JsonCodec {
    fn create_call(&self, task_name: &str, args: &Value) -> Result<Call> {
        let memo_key = serde_json::to_string(&(task_name, args))?;
        Ok(Call {
            task_name: task_name.to_string(),
            args: args.clone(),
            memo_key,
        })
    }

    fn encode_call(&self, call: &Call) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&call.args)?)
    }

    async fn invoke_task(
        &self,
        _memo_key: &str,
        task: &Task,
        payload: &[u8],
        ctx: TaskContext,
    ) -> Result<Outcome<Vec<u8>>> {
        let args: Value = serde_json::from_slice(payload)?;
        match task.run(ctx, args).await? {
            Outcome::Ready(value) => Ok(Outcome::Ready(serde_json::to_vec(&value)?)),
            Outcome::Pending(calls) => Ok(Outcome::Pending(calls)),
        }
    }

    fn decode_return(&self, payload: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(payload)?)
    }
}
