// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The durable matching queue.
//!
//! Holds users currently searching, plus the members of the in-flight batch.
//! A user is in at most one of the two sets. Every change to the waiting set
//! is followed by a full snapshot write to the [`QueueStore`] while the state
//! lock is still held, so snapshots reach the store in mutation order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{QueueEntry, UserId};
use crate::persistence::QueueStore;

#[derive(Debug, Clone, Copy)]
struct Slot {
    join_time: DateTime<Utc>,
    // tie-break for identical join times
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: HashMap<UserId, Slot>,
    in_flight: HashMap<UserId, DateTime<Utc>>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, user_id: UserId, join_time: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.insert(user_id, Slot { join_time, seq });
    }

    fn ordered(&self) -> Vec<(&UserId, Slot)> {
        let mut entries: Vec<_> = self.waiting.iter().map(|(id, slot)| (id, *slot)).collect();
        entries.sort_by(|(_, a), (_, b)| a.join_time.cmp(&b.join_time).then(a.seq.cmp(&b.seq)));
        entries
    }

    fn snapshot(&self) -> Vec<QueueEntry> {
        self.ordered()
            .into_iter()
            .map(|(id, slot)| QueueEntry {
                user_id: id.clone(),
                join_time: slot.join_time,
            })
            .collect()
    }
}

/// The matching queue.
pub struct MatchingQueue {
    state: Mutex<QueueState>,
    store: Arc<dyn QueueStore>,
}

impl MatchingQueue {
    /// Create an empty queue backed by `store`. Nothing is loaded.
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            store,
        }
    }

    /// Create a queue holding the last snapshot persisted in `store`.
    ///
    /// Duplicate ids in the snapshot keep their first occurrence.
    pub async fn restore(store: Arc<dyn QueueStore>) -> Result<Self> {
        let entries = store.load_queue_snapshot().await?;
        let mut state = QueueState::default();
        let mut duplicates = 0usize;

        for entry in entries {
            if state.waiting.contains_key(&entry.user_id) {
                duplicates += 1;
                continue;
            }
            state.insert(entry.user_id, entry.join_time);
        }

        if duplicates > 0 {
            warn!(duplicates, "Dropped duplicate entries from persisted queue snapshot");
        }
        info!(queue_size = state.waiting.len(), "Matching queue restored");

        Ok(Self {
            state: Mutex::new(state),
            store,
        })
    }

    /// Start searching. Returns `false` if the user is already waiting or in
    /// the in-flight batch.
    ///
    /// If the snapshot cannot be written the join is undone and the error returned.
    pub async fn join(&self, user_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.waiting.contains_key(user_id) || state.in_flight.contains_key(user_id) {
            return Ok(false);
        }

        state.insert(user_id.to_string(), Utc::now());
        if let Err(e) = self.store.save_queue_snapshot(&state.snapshot()).await {
            state.waiting.remove(user_id);
            return Err(e);
        }

        debug!(user_id = %user_id, queue_size = state.waiting.len(), "User joined matching queue");
        Ok(true)
    }

    /// Stop searching. Also removes the user from the in-flight batch so the
    /// current round neither notifies nor re-queues them.
    ///
    /// Returns `true` if the user was waiting or in flight. The removal is kept
    /// even when the snapshot write fails; the error is still returned.
    pub async fn leave(&self, user_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let was_in_flight = state.in_flight.remove(user_id).is_some();
        let was_waiting = state.waiting.remove(user_id).is_some();

        if was_waiting {
            self.store.save_queue_snapshot(&state.snapshot()).await?;
        }

        if was_waiting || was_in_flight {
            debug!(
                user_id = %user_id,
                in_flight = was_in_flight,
                queue_size = state.waiting.len(),
                "User left matching queue"
            );
        }
        Ok(was_waiting || was_in_flight)
    }

    /// Waiting members, oldest first. In-flight members are not included.
    pub async fn snapshot(&self) -> Vec<QueueEntry> {
        self.state.lock().await.snapshot()
    }

    /// Number of waiting members.
    pub async fn len(&self) -> usize {
        self.state.lock().await.waiting.len()
    }

    /// Whether no member is waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether `user_id` is waiting.
    pub async fn contains(&self, user_id: &str) -> bool {
        self.state.lock().await.waiting.contains_key(user_id)
    }

    /// Whether `user_id` is part of the in-flight batch.
    pub async fn is_in_flight(&self, user_id: &str) -> bool {
        self.state.lock().await.in_flight.contains_key(user_id)
    }

    /// Move up to `max` oldest members into the in-flight batch and persist
    /// the shrunken queue. If the write fails nothing is moved.
    pub async fn take_batch(&self, max: usize) -> Result<Vec<QueueEntry>> {
        let mut state = self.state.lock().await;

        let batch: Vec<QueueEntry> = state
            .ordered()
            .into_iter()
            .take(max)
            .map(|(id, slot)| QueueEntry {
                user_id: id.clone(),
                join_time: slot.join_time,
            })
            .collect();

        let mut taken = Vec::with_capacity(batch.len());
        for entry in &batch {
            if let Some(slot) = state.waiting.remove(&entry.user_id) {
                taken.push((entry.user_id.clone(), slot));
            }
        }

        if let Err(e) = self.store.save_queue_snapshot(&state.snapshot()).await {
            for (id, slot) in taken {
                state.waiting.insert(id, slot);
            }
            return Err(e);
        }

        for entry in &batch {
            state.in_flight.insert(entry.user_id.clone(), entry.join_time);
        }

        Ok(batch)
    }

    /// Mark an in-flight member as finished (matched). Returns `false` if the
    /// member already left.
    pub async fn complete(&self, user_id: &str) -> bool {
        self.state.lock().await.in_flight.remove(user_id).is_some()
    }

    /// Put in-flight members back into the waiting set with the given join
    /// times. Members that left during the round are skipped.
    ///
    /// Returns the ids that were re-queued. The in-memory queue keeps them
    /// even if the snapshot write fails.
    pub async fn requeue(&self, entries: Vec<QueueEntry>) -> Result<Vec<UserId>> {
        let mut state = self.state.lock().await;
        let mut requeued = Vec::new();

        for entry in entries {
            if state.in_flight.remove(&entry.user_id).is_none() {
                continue;
            }
            if state.waiting.contains_key(&entry.user_id) {
                continue;
            }
            requeued.push(entry.user_id.clone());
            state.insert(entry.user_id, entry.join_time);
        }

        if !requeued.is_empty() {
            self.store.save_queue_snapshot(&state.snapshot()).await?;
        }
        Ok(requeued)
    }

    /// Remove waiting members who joined before `cutoff`.
    ///
    /// If the snapshot cannot be written nobody is removed.
    pub async fn expire_joined_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UserId>> {
        let mut state = self.state.lock().await;

        let expired: Vec<UserId> = state
            .ordered()
            .into_iter()
            .take_while(|(_, slot)| slot.join_time < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return Ok(expired);
        }

        let mut removed = Vec::with_capacity(expired.len());
        for id in &expired {
            if let Some(slot) = state.waiting.remove(id) {
                removed.push((id.clone(), slot));
            }
        }
        if let Err(e) = self.store.save_queue_snapshot(&state.snapshot()).await {
            for (id, slot) in removed {
                state.waiting.insert(id, slot);
            }
            return Err(e);
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::Duration as ChronoDuration;

    fn queue() -> (Arc<MemoryStore>, MatchingQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = MatchingQueue::new(store.clone());
        (store, queue)
    }

    fn ids(entries: &[QueueEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.user_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let (store, queue) = queue();

        assert!(queue.join("u1").await.unwrap());
        assert!(!queue.join("u1").await.unwrap());
        assert!(queue.join("u2").await.unwrap());

        assert_eq!(ids(&queue.snapshot().await), vec!["u1", "u2"]);
        assert_eq!(store.queue_writes(), 2);
        assert_eq!(store.load_queue_snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_join_rolled_back_on_write_failure() {
        let (store, queue) = queue();
        store.set_fail_queue_writes(true);

        assert!(queue.join("u1").await.is_err());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_leave_persists() {
        let (store, queue) = queue();
        queue.join("u1").await.unwrap();
        queue.join("u2").await.unwrap();

        assert!(queue.leave("u1").await.unwrap());
        assert!(!queue.leave("u1").await.unwrap());
        assert_eq!(ids(&store.load_queue_snapshot().await.unwrap()), vec!["u2"]);
    }

    #[tokio::test]
    async fn test_uniqueness_under_mixed_operations() {
        let (_, queue) = queue();
        for round in 0..5 {
            for id in ["a", "b", "c", "a", "b"] {
                queue.join(id).await.unwrap();
            }
            if round % 2 == 1 {
                queue.leave("b").await.unwrap();
            }
        }

        let snapshot = queue.snapshot().await;
        let mut seen = std::collections::HashSet::new();
        for entry in &snapshot {
            assert!(seen.insert(entry.user_id.clone()), "{} twice", entry.user_id);
        }
        assert_eq!(snapshot.len(), 3);
    }

    #[tokio::test]
    async fn test_take_batch_moves_oldest_in_flight() {
        let (store, queue) = queue();
        for id in ["u1", "u2", "u3"] {
            queue.join(id).await.unwrap();
        }

        let batch = queue.take_batch(2).await.unwrap();
        assert_eq!(ids(&batch), vec!["u1", "u2"]);
        assert_eq!(ids(&queue.snapshot().await), vec!["u3"]);
        assert_eq!(ids(&store.load_queue_snapshot().await.unwrap()), vec!["u3"]);
        assert!(queue.is_in_flight("u1").await);
        assert!(!queue.contains("u1").await);

        // in-flight members cannot join twice
        assert!(!queue.join("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_take_batch_failure_keeps_queue() {
        let (store, queue) = queue();
        queue.join("u1").await.unwrap();
        queue.join("u2").await.unwrap();
        store.set_fail_queue_writes(true);

        assert!(queue.take_batch(2).await.is_err());
        assert_eq!(ids(&queue.snapshot().await), vec!["u1", "u2"]);
        assert!(!queue.is_in_flight("u1").await);
    }

    #[tokio::test]
    async fn test_leave_scrubs_in_flight() {
        let (_, queue) = queue();
        queue.join("u1").await.unwrap();
        queue.join("u2").await.unwrap();
        let batch = queue.take_batch(2).await.unwrap();

        assert!(queue.leave("u1").await.unwrap());
        assert!(!queue.is_in_flight("u1").await);
        assert!(!queue.complete("u1").await);

        let requeued = queue.requeue(batch).await.unwrap();
        assert_eq!(requeued, vec!["u2".to_string()]);
        assert_eq!(ids(&queue.snapshot().await), vec!["u2"]);
    }

    #[tokio::test]
    async fn test_requeue_uses_given_join_time() {
        let (_, queue) = queue();
        queue.join("u1").await.unwrap();
        queue.join("u2").await.unwrap();
        let mut batch = queue.take_batch(1).await.unwrap();

        let later = Utc::now() + ChronoDuration::seconds(60);
        batch[0].join_time = later;
        queue.requeue(batch).await.unwrap();

        let snapshot = queue.snapshot().await;
        assert_eq!(ids(&snapshot), vec!["u2", "u1"]);
        assert_eq!(snapshot[1].join_time, later);
    }

    #[tokio::test]
    async fn test_complete_removes_from_in_flight() {
        let (_, queue) = queue();
        queue.join("u1").await.unwrap();
        let batch = queue.take_batch(1).await.unwrap();

        assert!(queue.complete("u1").await);
        assert!(queue.requeue(batch).await.unwrap().is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_restore_from_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .save_queue_snapshot(&[
                QueueEntry { user_id: "old".into(), join_time: now - ChronoDuration::seconds(30) },
                QueueEntry { user_id: "new".into(), join_time: now },
                QueueEntry { user_id: "old".into(), join_time: now },
            ])
            .await
            .unwrap();

        let queue = MatchingQueue::restore(store).await.unwrap();
        let snapshot = queue.snapshot().await;
        assert_eq!(ids(&snapshot), vec!["old", "new"]);
        assert_eq!(snapshot[0].join_time, now - ChronoDuration::seconds(30));
    }

    #[tokio::test]
    async fn test_expire_joined_before() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .save_queue_snapshot(&[
                QueueEntry { user_id: "stale".into(), join_time: now - ChronoDuration::minutes(5) },
                QueueEntry { user_id: "fresh".into(), join_time: now },
            ])
            .await
            .unwrap();
        let queue = MatchingQueue::restore(store.clone()).await.unwrap();

        let expired = queue
            .expire_joined_before(now - ChronoDuration::minutes(2))
            .await
            .unwrap();
        assert_eq!(expired, vec!["stale".to_string()]);
        assert_eq!(ids(&store.load_queue_snapshot().await.unwrap()), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_expire_rolls_back_on_write_failure() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .save_queue_snapshot(&[QueueEntry { user_id: "stale".into(), join_time: now - ChronoDuration::minutes(5) }])
            .await
            .unwrap();
        let queue = MatchingQueue::restore(store.clone()).await.unwrap();

        store.set_fail_queue_writes(true);
        assert!(queue.expire_joined_before(now).await.is_err());
        assert!(queue.contains("stale").await);

        store.set_fail_queue_writes(false);
        assert_eq!(queue.expire_joined_before(now).await.unwrap(), vec!["stale".to_string()]);
        assert!(queue.is_empty().await);
    }
}
