// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key-value store and counter contracts.
//!
//! These traits express what a backend must provide for the engine to run on
//! top of it. The store holds the durable protocol state (calls, values,
//! pending returns); the cache holds best-effort counters. A deployment may
//! back both with one system or split them (a conditional-write table for the
//! store, a counter store for the cache).

use std::fmt;

use async_trait::async_trait;

use crate::error::StoreError;

/// Type alias for store results.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Logical namespace of a store key.
///
/// The namespaces are closed: the engine persists exactly three kinds of
/// record, all keyed by a call's memo key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Task name and encoded arguments for a memo key. Write-once by content.
    Call,
    /// Encoded return value of a completed call. Write-once.
    Value,
    /// Parents waiting on a call, plus its scheduled marker. CAS-mutated.
    PendingReturns,
}

impl Namespace {
    /// The string used in the rendered key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Value => "value",
            Self::PendingReturns => "pending_returns",
        }
    }
}

/// A typed store key, rendered as `namespace/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemKey {
    /// Logical namespace.
    pub namespace: Namespace,
    /// The memo key within the namespace.
    pub id: String,
}

impl MemKey {
    /// Key into the `call` namespace.
    pub fn call(id: impl Into<String>) -> Self {
        Self {
            namespace: Namespace::Call,
            id: id.into(),
        }
    }

    /// Key into the `value` namespace.
    pub fn value(id: impl Into<String>) -> Self {
        Self {
            namespace: Namespace::Value,
            id: id.into(),
        }
    }

    /// Key into the `pending_returns` namespace.
    pub fn pending_returns(id: impl Into<String>) -> Self {
        Self {
            namespace: Namespace::PendingReturns,
            id: id.into(),
        }
    }
}

impl fmt::Display for MemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace.as_str(), self.id)
    }
}

/// A remote, possibly contended key-value store.
///
/// Requirements on implementations:
///
/// - all mutating operations are idempotent;
/// - `get` reports absence as [`StoreError::NotFound`];
/// - the conditional operations (`set_new_value`, `compare_and_set`,
///   `compare_and_delete`) are linearizable per key; they are the only
///   synchronization primitive the engine uses. No cross-key transactions
///   are required.
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether a value exists under `key`.
    async fn has(&self, key: &MemKey) -> StoreResult<bool>;

    /// Read the value under `key`, or [`StoreError::NotFound`].
    async fn get(&self, key: &MemKey) -> StoreResult<Vec<u8>>;

    /// Unconditionally write `value` under `key`.
    async fn set(&self, key: &MemKey, value: &[u8]) -> StoreResult<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &MemKey) -> StoreResult<()>;

    /// Write `value` iff `key` is absent, else [`StoreError::CompareMismatch`].
    async fn set_new_value(&self, key: &MemKey, value: &[u8]) -> StoreResult<()>;

    /// Write `value` iff the current value equals `expected` byte for byte,
    /// else [`StoreError::CompareMismatch`]. An absent key is a mismatch.
    async fn compare_and_set(
        &self,
        key: &MemKey,
        value: &[u8],
        expected: &[u8],
    ) -> StoreResult<()>;

    /// Delete `key` iff the current value equals `expected` byte for byte,
    /// else [`StoreError::CompareMismatch`]. An absent key is a mismatch.
    async fn compare_and_delete(&self, key: &MemKey, expected: &[u8]) -> StoreResult<()>;
}

/// A best-effort counter store.
///
/// Counter keys are a disjoint keyspace from [`MemKey`]s. The engine uses
/// this for spawn-limit accounting only; no read-after-write consistency
/// beyond the atomicity of `incr` itself is required, and losing a counter
/// can at worst permit more work than the configured budget.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Atomically increment the counter under `key` by one and return the
    /// post-increment value. An absent counter starts at zero.
    async fn incr(&self, key: &str) -> StoreResult<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_key_rendering() {
        assert_eq!(MemKey::call("k1").to_string(), "call/k1");
        assert_eq!(MemKey::value("k1").to_string(), "value/k1");
        assert_eq!(
            MemKey::pending_returns("k1").to_string(),
            "pending_returns/k1"
        );
    }

    #[test]
    fn test_mem_key_equality_is_namespace_scoped() {
        assert_ne!(MemKey::call("k1"), MemKey::value("k1"));
        assert_eq!(MemKey::call("k1"), MemKey::call("k1"));
    }
}
