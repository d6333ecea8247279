// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration.

use std::env;

use crate::error::{Error, Result};

/// Tunables for the execution engine.
///
/// Can be built programmatically or loaded from the environment:
///
/// | Variable | Required | Default | Description |
/// |----------|----------|---------|-------------|
/// | `WHIRR_SPAWN_LIMIT` | No | `500` | Enqueue budget per root workflow |
/// | `WHIRR_CAS_RETRY_LIMIT` | No | `100` | CAS transaction retry budget |
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on queue enqueues within one root workflow. Exceeding it
    /// aborts the current worker turn with a spawn-limit error; durable state
    /// stays intact, so an operator can raise the limit and re-run.
    pub spawn_limit: i64,
    /// How often a CAS-guarded store transaction retries a lost race before
    /// giving up.
    pub cas_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            spawn_limit: 500,
            cas_retry_limit: 100,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = env::var("WHIRR_SPAWN_LIMIT") {
            config.spawn_limit = raw
                .parse()
                .map_err(|e| Error::Config(format!("invalid WHIRR_SPAWN_LIMIT: {e}")))?;
        }
        if let Ok(raw) = env::var("WHIRR_CAS_RETRY_LIMIT") {
            config.cas_retry_limit = raw
                .parse()
                .map_err(|e| Error::Config(format!("invalid WHIRR_CAS_RETRY_LIMIT: {e}")))?;
        }
        Ok(config)
    }

    /// Set the per-root spawn limit.
    pub fn with_spawn_limit(mut self, limit: i64) -> Self {
        self.spawn_limit = limit;
        self
    }

    /// Set the CAS retry budget.
    pub fn with_cas_retry_limit(mut self, limit: u32) -> Self {
        self.cas_retry_limit = limit;
        self
    }
}
