// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed façade over the store: calls, values, and pending returns.
//!
//! This module carries the engine's concurrency protocol. Call and value
//! records are effectively write-once; the pending-returns record is the one
//! genuinely contended object, mutated only through compare-and-set and
//! destroyed through compare-and-delete. Every CAS-guarded transaction here
//! retries on [`StoreError::CompareMismatch`] up to the configured limit;
//! exhausting it is [`Error::CasRetryLimit`] and almost certainly means the
//! backend's conditional writes are broken.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::call::Call;
use crate::codec::Codec;
use crate::error::{Error, Result, StoreError};
use crate::store::{MemKey, Store};

/// Persisted envelope of a `call` record: the task name plus codec-opaque
/// argument payload. The record is a pure function of its memo key, so
/// unconditional rewrites are no-ops by content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CallRecord {
    task_name: String,
    payload: Vec<u8>,
}

/// Set of parents waiting for a child call to complete.
///
/// When the child job is enqueued, a timestamp is stored here so later
/// waiters do not enqueue it again. The timestamp is deliberately coarse: it
/// measures age for cache expiry, never event order. A record with no
/// timestamp may never have been scheduled and must be.
///
/// CAS compares bytes, so the encoding must be byte-canonical: the
/// `BTreeSet` iterates sorted and MessagePack lays structs out in field
/// order, which together guarantee it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingReturns {
    scheduled_at: Option<i64>,
    returns: BTreeSet<String>,
}

impl PendingReturns {
    fn first(parent_key: &str) -> Self {
        let mut returns = BTreeSet::new();
        returns.insert(parent_key.to_string());
        Self {
            scheduled_at: None,
            returns,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Typed namespace façade over a [`Store`], tied to the codec that derives
/// call identities.
pub struct Memory {
    store: Arc<dyn Store>,
    codec: Arc<dyn Codec>,
    cas_retry_limit: u32,
}

impl Memory {
    /// Wrap a store and codec.
    pub fn new(store: Arc<dyn Store>, codec: Arc<dyn Codec>, cas_retry_limit: u32) -> Self {
        Self {
            store,
            codec,
            cas_retry_limit,
        }
    }

    /// The codec calls are derived with.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Create a [`Call`]. Lives here because call identity is inherently tied
    /// to the codec.
    pub fn make_call(&self, task_name: &str, args: &serde_json::Value) -> Result<Call> {
        self.codec.create_call(task_name, args)
    }

    /// Whether a call record exists.
    pub async fn has_call(&self, call: &Call) -> Result<bool> {
        Ok(self.store.has(&MemKey::call(&call.memo_key)).await?)
    }

    /// Persist a call record. Unconditional: the record is a function of the
    /// memo key, so concurrent writers store identical bytes.
    pub async fn set_call(&self, call: &Call) -> Result<()> {
        let record = CallRecord {
            task_name: call.task_name.clone(),
            payload: self.codec.encode_call(call)?,
        };
        let bytes = rmp_serde::to_vec(&record).map_err(|e| Error::Codec(e.to_string()))?;
        self.store
            .set(&MemKey::call(&call.memo_key), &bytes)
            .await?;
        Ok(())
    }

    /// Load and split a call record into `(task_name, payload)`.
    pub async fn get_call_bytes(&self, memo_key: &str) -> Result<(String, Vec<u8>)> {
        let bytes = self.store.get(&MemKey::call(memo_key)).await?;
        let record: CallRecord =
            rmp_serde::from_slice(&bytes).map_err(|e| Error::Codec(e.to_string()))?;
        Ok((record.task_name, record.payload))
    }

    /// Whether a value exists for `memo_key`.
    pub async fn has_value(&self, memo_key: &str) -> Result<bool> {
        Ok(self.store.has(&MemKey::value(memo_key)).await?)
    }

    /// Read the memoized return bytes, if the call has completed.
    pub async fn get_value(&self, memo_key: &str) -> Result<Option<Vec<u8>>> {
        match self.store.get(&MemKey::value(memo_key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a call's return bytes, set-if-absent.
    ///
    /// A lost race surfaces as [`Error::ValueAlreadyExists`] rather than
    /// passing silently: only one value may ever exist for a memo key, and
    /// callers must decide explicitly to discard theirs.
    pub async fn set_value(&self, memo_key: &str, payload: &[u8]) -> Result<()> {
        match self
            .store
            .set_new_value(&MemKey::value(memo_key), payload)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::CompareMismatch) => Err(Error::ValueAlreadyExists {
                memo_key: memo_key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Register `parent_key` as a waiter on the call under `memo_key`.
    ///
    /// The first waiter of a child is responsible for enqueueing it:
    /// `schedule_job` runs while the record's scheduled marker is unset, and
    /// the marker is stored afterwards so later waiters skip the enqueue.
    /// Concurrent waiters serialise through compare-and-set; a lost race
    /// retries the whole transaction, which may invoke `schedule_job` again;
    /// the queue tolerates that duplicate.
    ///
    /// Returns `true` when this call created the record, i.e. no waiter
    /// existed before. As soon as this returns, another worker may already
    /// have consumed and cleared the registration; it is visible to *some*
    /// worker, not necessarily to a later read from this one.
    pub async fn add_pending_return<'a, F>(
        &self,
        memo_key: &str,
        parent_key: &str,
        schedule_job: F,
    ) -> Result<bool>
    where
        F: Fn() -> BoxFuture<'a, Result<()>>,
    {
        // Race conditions live on every line of this transaction; mind the
        // ordering of the conditional writes.
        let key = MemKey::pending_returns(memo_key);
        let mut attempts = 0u32;
        loop {
            let result: Result<bool> = async {
                let mut created = false;
                let mut store_again = false;
                let (mut pending, observed_enc) = match self.store.get(&key).await {
                    Ok(enc) => {
                        let mut pending = PendingReturns::decode(&enc)?;
                        if pending.returns.insert(parent_key.to_string()) {
                            store_again = true;
                        }
                        (pending, enc)
                    }
                    Err(StoreError::NotFound(_)) => {
                        let pending = PendingReturns::first(parent_key);
                        let enc = pending.encode()?;
                        // Creation itself is conditional: a concurrent first
                        // waiter loses here and retries against our record.
                        self.store.set_new_value(&key, &enc).await?;
                        created = true;
                        (pending, enc)
                    }
                    Err(e) => return Err(e.into()),
                };

                if pending.scheduled_at.is_none() {
                    schedule_job().await?;
                    pending.scheduled_at = Some(Utc::now().timestamp());
                    store_again = true;
                }

                if store_again {
                    self.store
                        .compare_and_set(&key, &pending.encode()?, &observed_enc)
                        .await?;
                }
                debug!(child = %memo_key, parent = %parent_key, created, "pending return registered");
                Ok(created)
            }
            .await;

            match result {
                Err(e) if e.is_compare_mismatch() => {
                    attempts += 1;
                    self.check_cas_budget(&key, attempts)?;
                }
                other => return other,
            }
        }
    }

    /// Hand the set of waiting parents to `handle`, then delete the record.
    ///
    /// Called by the worker that stored the child's value, the sole party
    /// that removes the record. A compare-and-delete conflict means waiters
    /// were added concurrently; the retry re-reads and hands `handle` only
    /// the parents not seen on a previous attempt, so one completion never
    /// schedules the same parent twice. An absent record means either no
    /// waiter ever registered or a concurrent duplicate execution drained it;
    /// `handle` runs once with no parents.
    pub async fn with_pending_returns_remove<'a, F>(
        &self,
        memo_key: &str,
        mut handle: F,
    ) -> Result<()>
    where
        F: FnMut(Vec<String>) -> BoxFuture<'a, Result<()>>,
    {
        let key = MemKey::pending_returns(memo_key);
        let mut handled: BTreeSet<String> = BTreeSet::new();
        let mut attempts = 0u32;
        loop {
            let observed_enc = match self.store.get(&key).await {
                Ok(enc) => enc,
                Err(StoreError::NotFound(_)) => {
                    return handle(Vec::new()).await;
                }
                Err(e) => return Err(e.into()),
            };
            let pending = PendingReturns::decode(&observed_enc)?;
            let to_handle: Vec<String> = pending.returns.difference(&handled).cloned().collect();
            debug!(child = %memo_key, parents = to_handle.len(), "handling pending returns");
            handle(to_handle.clone()).await?;
            handled.extend(to_handle);

            match self.store.compare_and_delete(&key, &observed_enc).await {
                Ok(()) => return Ok(()),
                Err(StoreError::CompareMismatch) => {
                    attempts += 1;
                    self.check_cas_budget(&key, attempts)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn check_cas_budget(&self, key: &MemKey, attempts: u32) -> Result<()> {
        if attempts > self.cas_retry_limit {
            return Err(Error::CasRetryLimit {
                key: key.to_string(),
                limit: self.cas_retry_limit,
            });
        }
        Ok(())
    }
}
