// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory backends for whirr engine tests and examples.
//!
//! [`MemoryStore`] implements the store and cache contracts over a plain map
//! with real conditional-write semantics; [`MemoryQueue`] is a closable FIFO
//! channel with a bounded blocking receive. Neither is durable; that is the
//! point: they make the engine's protocol observable in a single process.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use whirr_core::{
    Cache, MemKey, Message, Queue, QueueError, QueueInfo, QueueResult, Store, StoreError,
    StoreResult,
};

/// A store that stores bytes. Conditional operations compare exact bytes,
/// exactly like a remote conditional-write table would.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
    counters: Mutex<HashMap<String, i64>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all raw keys, for invariant assertions in tests.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of all counters, for spawn-accounting assertions in tests.
    pub async fn counters(&self) -> HashMap<String, i64> {
        self.counters.lock().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn has(&self, key: &MemKey) -> StoreResult<bool> {
        Ok(self.inner.lock().await.contains_key(&key.to_string()))
    }

    async fn get(&self, key: &MemKey) -> StoreResult<Vec<u8>> {
        self.inner
            .lock()
            .await
            .get(&key.to_string())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &MemKey, value: &[u8]) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &MemKey) -> StoreResult<()> {
        self.inner.lock().await.remove(&key.to_string());
        Ok(())
    }

    async fn set_new_value(&self, key: &MemKey, value: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let rendered = key.to_string();
        if inner.contains_key(&rendered) {
            return Err(StoreError::CompareMismatch);
        }
        inner.insert(rendered, value.to_vec());
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &MemKey,
        value: &[u8],
        expected: &[u8],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let rendered = key.to_string();
        match inner.get(&rendered) {
            Some(current) if current == expected => {
                inner.insert(rendered, value.to_vec());
                Ok(())
            }
            _ => Err(StoreError::CompareMismatch),
        }
    }

    async fn compare_and_delete(&self, key: &MemKey, expected: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let rendered = key.to_string();
        match inner.get(&rendered) {
            Some(current) if current == expected => {
                inner.remove(&rendered);
                Ok(())
            }
            _ => Err(StoreError::CompareMismatch),
        }
    }
}

#[async_trait]
impl Cache for MemoryStore {
    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

struct QueueState {
    messages: VecDeque<String>,
    closed: bool,
}

/// A closable in-memory FIFO queue. No receipts: a delivered message is gone.
///
/// `get_message` blocks until a message arrives, the queue closes, or the
/// receive wait elapses (then `QueueError::Empty`, and the caller re-polls).
/// A closed queue reports `Closed` even while messages remain, matching the
/// terminal-close contract.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    recv_wait: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    /// Create a queue with the default 20 s receive wait.
    pub fn new() -> Self {
        Self::with_recv_wait(Duration::from_secs(20))
    }

    /// Create a queue with a custom receive wait. Tests use a short one so a
    /// stuck loop fails fast instead of hanging.
    pub fn with_recv_wait(recv_wait: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            recv_wait,
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn put(&self, body: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.messages.push_back(body.to_string());
        self.notify.notify_one();
        Ok(())
    }

    async fn get_message(&self) -> QueueResult<Message> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if let Some(body) = state.messages.pop_front() {
                    return Ok(Message { body });
                }
            }
            // notify_one leaves a permit when nobody is waiting yet, so a put
            // racing this gap is not lost.
            if timeout(self.recv_wait, self.notify.notified()).await.is_err() {
                return Err(QueueError::Empty);
            }
        }
    }

    async fn get_info(&self) -> QueueResult<QueueInfo> {
        let state = self.state.lock().await;
        Ok(QueueInfo {
            num_messages: state.messages.len(),
            num_inflight: 0,
        })
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        self.notify.notify_one();
    }
}
