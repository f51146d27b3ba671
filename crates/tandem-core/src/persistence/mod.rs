// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for tandem-core.
//!
//! The engine itself only needs two durable documents: the queue snapshot and
//! the algorithm config. Both are written by full replacement.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{AlgorithmConfig, QueueEntry};

/// Durable storage for the matching queue snapshot.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Replace the stored snapshot with `entries`.
    async fn save_queue_snapshot(&self, entries: &[QueueEntry]) -> Result<()>;

    /// Load the last stored snapshot. Empty if nothing was ever saved.
    async fn load_queue_snapshot(&self) -> Result<Vec<QueueEntry>>;
}

/// Durable storage for the algorithm config document.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load the persisted config, `None` if no document exists.
    async fn load_algorithm_config(&self) -> Result<Option<AlgorithmConfig>>;

    /// Replace the persisted config.
    async fn save_algorithm_config(&self, config: &AlgorithmConfig) -> Result<()>;
}
