// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Point-to-point message queue contract.
//!
//! The queue carries opaque UTF-8 job messages between schedulers and
//! workers. Delivery is at-least-once and ordering is FIFO-ish; the engine's
//! protocol tolerates duplicates (the scheduled marker on pending returns
//! suppresses most, memoization absorbs the rest) and reorders.

use async_trait::async_trait;

use crate::error::QueueError;

/// Type alias for queue results.
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// A message received from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw UTF-8 body, here always `rootId/memoKey`.
    pub body: String,
}

/// Observability snapshot of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    /// Messages waiting for delivery.
    pub num_messages: usize,
    /// Messages delivered but not yet settled, where the backend tracks
    /// receipts. Zero for backends that do not.
    pub num_inflight: usize,
}

/// Multi-producer, multi-consumer job channel.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a message body.
    async fn put(&self, body: &str) -> QueueResult<()>;

    /// Receive one message, blocking up to an implementation-chosen bound.
    ///
    /// Returns [`QueueError::Empty`] when the bound elapses with nothing to
    /// deliver, and [`QueueError::Closed`] once the queue has been terminally
    /// closed. Under normal operation each enqueued body is delivered to
    /// exactly one consumer.
    async fn get_message(&self) -> QueueResult<Message>;

    /// Queue statistics. Observability only; never used for control flow.
    async fn get_info(&self) -> QueueResult<QueueInfo>;

    /// Durably signal that no further messages will be produced. Pending and
    /// future receivers unblock with [`QueueError::Closed`].
    async fn close(&self);
}
