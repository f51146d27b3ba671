// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tandem-core integration tests.
//!
//! Provides user fixtures, collaborator doubles and a [`Harness`] that wires a
//! queue and an orchestrator over an in-memory store.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use tandem_core::collaborators::{MatchRecorder, Notifier, ProfileSource, ZodiacMatrix};
use tandem_core::config_watcher::ConfigHandle;
use tandem_core::error::{Error, Result};
use tandem_core::model::{
    AlgorithmConfig, ConversationId, Gender, GeoPoint, MatchNotification, MatchPreferences,
    MatchResult, QueueEntry, UserId, UserSnapshot, ZodiacSign,
};
use tandem_core::orchestrator::{Collaborators, MatchOrchestrator, OrchestratorConfig, TickOutcome};
use tandem_core::persistence::{MemoryStore, QueueStore};
use tandem_core::queue::MatchingQueue;
use tandem_core::scoring::RangePolicy;

/// Latitude shared by all fixtures; users differ by longitude only.
pub const LAT: f64 = 21.0;

/// A user who only cares about distance.
pub fn user(id: &str, gender: Gender, desired: Gender, lon: f64) -> UserSnapshot {
    UserSnapshot {
        id: id.to_string(),
        gender,
        location: Some(GeoPoint::new(lon, LAT)),
        birth_date: NaiveDate::from_ymd_opt(1996, 4, 20),
        zodiac: ZodiacSign::Taurus,
        interests: BTreeSet::new(),
        preferences: MatchPreferences {
            desired_gender: desired,
            max_distance_km: 50.0,
            interest_weight: 0,
            distance_weight: 10,
            zodiac_weight: 0,
            age_weight: 0,
            max_age_difference: 5,
        },
    }
}

/// A man looking for a woman.
pub fn man(id: &str, lon: f64) -> UserSnapshot {
    user(id, Gender::Male, Gender::Female, lon)
}

/// A woman looking for a man.
pub fn woman(id: &str, lon: f64) -> UserSnapshot {
    user(id, Gender::Female, Gender::Male, lon)
}

/// Algorithm config with the given batch threshold.
pub fn algorithm(min_users: usize) -> AlgorithmConfig {
    AlgorithmConfig {
        min_users,
        max_wait_time: Duration::from_secs(30),
        user_timeout: Duration::from_secs(120),
    }
}

/// Notifier that records every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(UserId, MatchNotification)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose deliveries all fail (after being recorded).
    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.fail.store(true, Ordering::SeqCst);
        notifier
    }

    pub async fn events(&self) -> Vec<(UserId, MatchNotification)> {
        self.events.lock().await.clone()
    }

    pub async fn events_for(&self, user_id: &str) -> Vec<MatchNotification> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == user_id)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Partner and conversation from the user's match notification, if any.
    pub async fn matched(&self, user_id: &str) -> Option<(UserId, ConversationId)> {
        self.events_for(user_id).await.into_iter().find_map(|n| match n {
            MatchNotification::Matched {
                partner_id,
                conversation_id,
                ..
            } => Some((partner_id, conversation_id)),
            _ => None,
        })
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: &str, notification: &MatchNotification) -> Result<()> {
        self.events
            .lock()
            .await
            .push((user_id.to_string(), notification.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::collaborator("notifier", "socket closed"));
        }
        Ok(())
    }
}

/// Recorder that delegates to a [`MemoryStore`] and can fail on a given call
/// or make users leave while a record is in progress.
pub struct ScriptedRecorder {
    inner: Arc<MemoryStore>,
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
    leave_during_record: Vec<UserId>,
    queue: OnceLock<Arc<MatchingQueue>>,
}

impl ScriptedRecorder {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            fail_on_call: None,
            leave_during_record: Vec::new(),
            queue: OnceLock::new(),
        }
    }

    /// Fail the n-th call (1-based).
    pub fn fail_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// Make these users leave the queue while the first record is in progress.
    pub fn leave_during_record(mut self, users: &[&str]) -> Self {
        self.leave_during_record = users.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MatchRecorder for ScriptedRecorder {
    async fn record_match(&self, pair: &MatchResult) -> Result<ConversationId> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(queue) = self.queue.get() {
            for user_id in &self.leave_during_record {
                queue.leave(user_id).await?;
            }
        }
        if self.fail_on_call == Some(call) {
            return Err(Error::collaborator("match recorder", "conversation service unavailable"));
        }
        self.inner.record_match(pair).await
    }
}

/// Profile source that delegates to a [`MemoryStore`], optionally failing or
/// making users leave while snapshots load.
pub struct ScriptedProfiles {
    inner: Arc<MemoryStore>,
    fail: AtomicBool,
    leave_during_load: Vec<UserId>,
    queue: OnceLock<Arc<MatchingQueue>>,
}

impl ScriptedProfiles {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
            leave_during_load: Vec::new(),
            queue: OnceLock::new(),
        }
    }

    pub fn leave_during_load(mut self, users: &[&str]) -> Self {
        self.leave_during_load = users.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProfileSource for ScriptedProfiles {
    async fn load_user_snapshots(&self, user_ids: &[UserId]) -> Result<Vec<UserSnapshot>> {
        if let Some(queue) = self.queue.get() {
            for user_id in &self.leave_during_load {
                queue.leave(user_id).await?;
            }
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::collaborator("profile source", "database unavailable"));
        }
        self.inner.load_user_snapshots(user_ids).await
    }
}

/// Queue + orchestrator over an in-memory store with recording collaborators.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MatchingQueue>,
    pub notifier: Arc<RecordingNotifier>,
    pub recorder: Arc<ScriptedRecorder>,
    pub profiles: Arc<ScriptedProfiles>,
    pub orchestrator: MatchOrchestrator,
}

/// Options for [`Harness::build`].
pub struct HarnessOptions {
    pub min_users: usize,
    pub users: Vec<UserSnapshot>,
    /// Queue contents persisted before the queue is restored.
    pub seed: Vec<QueueEntry>,
    pub settings: OrchestratorConfig,
    pub notifier: RecordingNotifier,
    pub recorder: fn(Arc<MemoryStore>) -> ScriptedRecorder,
    pub profiles: fn(Arc<MemoryStore>) -> ScriptedProfiles,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            min_users: 2,
            users: Vec::new(),
            seed: Vec::new(),
            settings: OrchestratorConfig {
                tick_interval: Duration::from_millis(100),
                range_policy: RangePolicy::SoftDecay,
                expire_stale_members: false,
            },
            notifier: RecordingNotifier::new(),
            recorder: ScriptedRecorder::new,
            profiles: ScriptedProfiles::new,
        }
    }
}

impl Harness {
    /// Harness with `min_users` and the given profiles; nobody is queued yet.
    pub async fn new(min_users: usize, users: Vec<UserSnapshot>) -> Self {
        Self::build(HarnessOptions {
            min_users,
            users,
            ..HarnessOptions::default()
        })
        .await
    }

    pub async fn build(options: HarnessOptions) -> Self {
        let store = Arc::new(MemoryStore::with_profiles(options.users).await);
        store.save_queue_snapshot(&options.seed).await.unwrap();
        let queue = Arc::new(MatchingQueue::restore(store.clone()).await.unwrap());

        let recorder = Arc::new((options.recorder)(store.clone()));
        let _ = recorder.queue.set(queue.clone());
        let profiles = Arc::new((options.profiles)(store.clone()));
        let _ = profiles.queue.set(queue.clone());
        let notifier = Arc::new(options.notifier);

        let collaborators = Collaborators {
            profiles: profiles.clone(),
            zodiac: Arc::new(ZodiacMatrix::new()),
            recorder: recorder.clone(),
            notifier: notifier.clone(),
        };
        let orchestrator = MatchOrchestrator::new(
            queue.clone(),
            collaborators,
            ConfigHandle::fixed(algorithm(options.min_users)),
            options.settings,
        );

        Self {
            store,
            queue,
            notifier,
            recorder,
            profiles,
            orchestrator,
        }
    }

    pub async fn tick(&mut self) -> TickOutcome {
        self.orchestrator.tick().await
    }

    /// Queue users in order.
    pub async fn join(&self, ids: &[&str]) {
        for id in ids {
            assert!(self.queue.join(id).await.unwrap(), "{} already queued", id);
        }
    }

    /// Ids currently waiting, oldest first.
    pub async fn waiting(&self) -> Vec<UserId> {
        self.queue
            .snapshot()
            .await
            .into_iter()
            .map(|e| e.user_id)
            .collect()
    }
}
