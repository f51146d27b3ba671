// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store for embedding and tests.
//!
//! Implements both stores plus the profile and recorder collaborators, with
//! switches to make individual operations fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ConfigStore, QueueStore};
use crate::collaborators::{MatchRecorder, ProfileSource};
use crate::error::{Error, Result};
use crate::model::{AlgorithmConfig, ConversationId, MatchResult, QueueEntry, UserId, UserSnapshot};

/// In-memory implementation of every storage-side trait.
#[derive(Default)]
pub struct MemoryStore {
    queue: Mutex<Vec<QueueEntry>>,
    queue_writes: AtomicUsize,
    config: Mutex<Option<AlgorithmConfig>>,
    profiles: Mutex<HashMap<UserId, UserSnapshot>>,
    conversations: Mutex<HashMap<MatchResult, ConversationId>>,
    history: Mutex<Vec<(MatchResult, ConversationId)>>,
    fail_queue_writes: AtomicBool,
    fail_config_reads: AtomicBool,
    fail_record_match: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given profiles.
    pub async fn with_profiles(profiles: impl IntoIterator<Item = UserSnapshot>) -> Self {
        let store = Self::new();
        for profile in profiles {
            store.put_profile(profile).await;
        }
        store
    }

    /// Insert or replace a profile.
    pub async fn put_profile(&self, profile: UserSnapshot) {
        self.profiles.lock().await.insert(profile.id.clone(), profile);
    }

    /// Make queue snapshot writes fail.
    pub fn set_fail_queue_writes(&self, fail: bool) {
        self.fail_queue_writes.store(fail, Ordering::SeqCst);
    }

    /// Make config reads fail.
    pub fn set_fail_config_reads(&self, fail: bool) {
        self.fail_config_reads.store(fail, Ordering::SeqCst);
    }

    /// Make `record_match` fail.
    pub fn set_fail_record_match(&self, fail: bool) {
        self.fail_record_match.store(fail, Ordering::SeqCst);
    }

    /// Number of successful queue snapshot writes.
    pub fn queue_writes(&self) -> usize {
        self.queue_writes.load(Ordering::SeqCst)
    }

    /// Recorded matches, oldest first.
    pub async fn match_history(&self) -> Vec<(MatchResult, ConversationId)> {
        self.history.lock().await.clone()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn save_queue_snapshot(&self, entries: &[QueueEntry]) -> Result<()> {
        if self.fail_queue_writes.load(Ordering::SeqCst) {
            return Err(Error::persistence("save_queue_snapshot", "write failure injected"));
        }
        *self.queue.lock().await = entries.to_vec();
        self.queue_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_queue_snapshot(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.queue.lock().await.clone())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load_algorithm_config(&self) -> Result<Option<AlgorithmConfig>> {
        if self.fail_config_reads.load(Ordering::SeqCst) {
            return Err(Error::persistence("load_algorithm_config", "read failure injected"));
        }
        Ok(*self.config.lock().await)
    }

    async fn save_algorithm_config(&self, config: &AlgorithmConfig) -> Result<()> {
        *self.config.lock().await = Some(*config);
        Ok(())
    }
}

#[async_trait]
impl ProfileSource for MemoryStore {
    async fn load_user_snapshots(&self, user_ids: &[UserId]) -> Result<Vec<UserSnapshot>> {
        let profiles = self.profiles.lock().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| profiles.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl MatchRecorder for MemoryStore {
    async fn record_match(&self, pair: &MatchResult) -> Result<ConversationId> {
        if self.fail_record_match.load(Ordering::SeqCst) {
            return Err(Error::collaborator("match recorder", "failure injected"));
        }
        let conversation_id = self
            .conversations
            .lock()
            .await
            .entry(pair.clone())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        self.history
            .lock()
            .await
            .push((pair.clone(), conversation_id.clone()));
        Ok(conversation_id)
    }
}
