// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch orchestrator.
//!
//! A single task owns the orchestrator and drives it from a tick interval, the
//! one-shot waiting timer, config changes and shutdown. Rounds run inline in
//! that task, so at most one round is ever in progress.
//!
//! ```text
//!            size < 2                         size >= min_users
//!   ┌──────┐ ◀──────── ┌─────────┐ ─────────────────────────▶ ┌─────────┐
//!   │ Idle │ ────────▶ │ Waiting │  timer: min_users /= 2     │ Running │
//!   └──────┘ 2 <= size └─────────┘ (floor 2), re-arm          └─────────┘
//!      ▲      < min                                                │
//!      └───────────────────────────────────────────────────────────┘
//! ```
//!
//! A round pops the oldest `min_users` members, builds preference lists for
//! both sides, solves, then commits each pair: record the match, notify both
//! members. Members left over get a fresh join time. If anything fails before
//! a pair is committed, the uncommitted members go back with their original
//! join times and the next tick retries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::collaborators::{MatchRecorder, Notifier, ProfileSource, ZodiacTable};
use crate::config_watcher::ConfigHandle;
use crate::error::{Error, Result};
use crate::model::{
    AlgorithmConfig, ConversationId, MIN_BATCH_FLOOR, MatchNotification, MatchResult, QueueEntry,
    UserId, UserSnapshot,
};
use crate::preferences::{PreferenceListBuilder, split_by_side};
use crate::queue::MatchingQueue;
use crate::scoring::{CompatibilityScorer, RangePolicy};
use crate::solver::StableMatcher;

/// Message sent to members removed by the per-member timeout.
pub const EXPIRED_MESSAGE: &str = "No match found in time. Please start searching again.";

/// Orchestrator settings that are fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the orchestrator ticks
    pub tick_interval: Duration,
    /// Distance/age handling for out-of-range candidates
    pub range_policy: RangePolicy,
    /// Expire members that waited longer than `user_timeout`
    pub expire_stale_members: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            range_policy: RangePolicy::SoftDecay,
            expire_stale_members: false,
        }
    }
}

/// The external collaborators a round talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Profile and preference snapshots.
    pub profiles: Arc<dyn ProfileSource>,
    /// Zodiac compatibility table.
    pub zodiac: Arc<dyn ZodiacTable>,
    /// Conversation and match-history writer.
    pub recorder: Arc<dyn MatchRecorder>,
    /// Delivery channel.
    pub notifier: Arc<dyn Notifier>,
}

/// Where the orchestrator's state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Fewer than two members are waiting.
    Idle,
    /// Enough members to pair someone, not enough for a full batch.
    Waiting {
        /// When waiting started.
        since: Instant,
    },
    /// A round is in progress.
    Running,
}

/// A pair that was recorded during a round.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedPair {
    /// The pair.
    pub pair: MatchResult,
    /// Conversation returned by the recorder.
    pub conversation_id: ConversationId,
}

/// What happened in one round.
#[derive(Debug, Default)]
pub struct RoundReport {
    /// Members popped into the batch.
    pub batch_size: usize,
    /// Pairs recorded, in commit order.
    pub committed: Vec<CommittedPair>,
    /// Solved pairs dropped because a member left before commit.
    pub skipped_pairs: usize,
    /// Members put back into the queue.
    pub requeued: Vec<UserId>,
    /// The failure that cut the round short, if any.
    pub error: Option<Error>,
}

impl RoundReport {
    /// Whether the round ran to completion.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of one tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// Too few members to do anything.
    Idle {
        /// Waiting members.
        queue_size: usize,
    },
    /// Below the current batch threshold.
    Waiting {
        /// Waiting members.
        queue_size: usize,
        /// The threshold in effect.
        min_users: usize,
    },
    /// A round ran.
    Round(RoundReport),
}

/// The batch orchestrator.
pub struct MatchOrchestrator {
    queue: Arc<MatchingQueue>,
    collaborators: Collaborators,
    config: ConfigHandle,
    settings: OrchestratorConfig,
    baseline: AlgorithmConfig,
    effective_min_users: usize,
    state: OrchestratorState,
    wait_deadline: Option<Instant>,
    solver: StableMatcher,
    shutdown: Arc<Notify>,
}

impl MatchOrchestrator {
    /// Create an orchestrator. The baseline config is read from `config`.
    pub fn new(
        queue: Arc<MatchingQueue>,
        collaborators: Collaborators,
        config: ConfigHandle,
        settings: OrchestratorConfig,
    ) -> Self {
        let baseline = config.current().normalized();
        Self {
            queue,
            collaborators,
            config,
            settings,
            baseline,
            effective_min_users: baseline.min_users,
            state: OrchestratorState::Idle,
            wait_deadline: None,
            solver: StableMatcher,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Current state.
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Batch threshold in effect, including any anti-starvation reduction.
    pub fn effective_min_users(&self) -> usize {
        self.effective_min_users
    }

    /// The configured baseline.
    pub fn baseline(&self) -> AlgorithmConfig {
        self.baseline
    }

    /// When the waiting timer fires, if armed.
    pub fn wait_deadline(&self) -> Option<Instant> {
        self.wait_deadline
    }

    /// Replace the baseline. An active reduction is kept unless the new
    /// baseline is lower still.
    pub fn apply_config(&mut self, config: AlgorithmConfig) {
        let config = config.normalized();
        if config == self.baseline {
            return;
        }

        let reduced = self.effective_min_users < self.baseline.min_users;
        self.baseline = config;
        self.effective_min_users = if reduced {
            self.effective_min_users.min(config.min_users)
        } else {
            config.min_users
        };

        info!(
            min_users = config.min_users,
            effective_min_users = self.effective_min_users,
            "Applied new algorithm config"
        );
    }

    /// Run one step of the state machine.
    pub async fn tick(&mut self) -> TickOutcome {
        let latest = self.config.current();
        self.apply_config(latest);

        if self.settings.expire_stale_members {
            self.expire_stale_members().await;
        }

        if self.wait_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.on_wait_timer_fired().await;
        }

        let queue_size = self.queue.len().await;
        if queue_size == 0 {
            self.restore_baseline();
        }

        if queue_size < MIN_BATCH_FLOOR {
            self.reset_waiting();
            return TickOutcome::Idle { queue_size };
        }

        if queue_size < self.effective_min_users {
            if self.wait_deadline.is_none() {
                self.arm_wait_timer();
                info!(
                    queue_size,
                    min_users = self.effective_min_users,
                    max_wait_ms = self.baseline.max_wait_time.as_millis() as u64,
                    "Waiting for more users"
                );
            }
            return TickOutcome::Waiting {
                queue_size,
                min_users: self.effective_min_users,
            };
        }

        self.reset_waiting();
        self.state = OrchestratorState::Running;
        let report = self.run_round().await;
        self.state = OrchestratorState::Idle;

        TickOutcome::Round(report)
    }

    /// Handle the waiting timer. Halves the threshold (floor 2) if the queue is
    /// still short and re-arms the timer if that is not enough.
    pub async fn on_wait_timer_fired(&mut self) {
        self.wait_deadline = None;
        let queue_size = self.queue.len().await;

        if queue_size < MIN_BATCH_FLOOR {
            self.state = OrchestratorState::Idle;
            return;
        }
        if queue_size >= self.effective_min_users {
            return;
        }

        let reduced = (self.effective_min_users / 2).max(MIN_BATCH_FLOOR);
        if reduced < self.effective_min_users {
            warn!(
                queue_size,
                from = self.effective_min_users,
                to = reduced,
                "Reducing batch threshold after waiting too long"
            );
            self.effective_min_users = reduced;
        }

        if queue_size < self.effective_min_users {
            self.arm_wait_timer();
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self) {
        info!(
            tick_interval_ms = self.settings.tick_interval.as_millis() as u64,
            min_users = self.baseline.min_users,
            range_policy = %self.settings.range_policy,
            "Match orchestrator started"
        );

        let shutdown = self.shutdown.clone();
        let mut config = self.config.clone();
        let mut config_open = true;
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.wait_deadline;
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Match orchestrator shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_wait_timer_fired().await;
                }
                changed = config.changed(), if config_open => {
                    match changed {
                        Some(latest) => self.apply_config(latest),
                        None => config_open = false,
                    }
                }
            }
        }

        // a pending waiting timer dies with the loop
        self.reset_waiting();
    }

    fn arm_wait_timer(&mut self) {
        let now = Instant::now();
        if !matches!(self.state, OrchestratorState::Waiting { .. }) {
            self.state = OrchestratorState::Waiting { since: now };
        }
        self.wait_deadline = Some(now + self.baseline.max_wait_time);
    }

    fn reset_waiting(&mut self) {
        self.wait_deadline = None;
        if matches!(self.state, OrchestratorState::Waiting { .. }) {
            self.state = OrchestratorState::Idle;
        }
    }

    fn restore_baseline(&mut self) {
        if self.effective_min_users != self.baseline.min_users {
            info!(
                min_users = self.baseline.min_users,
                "Queue drained, restoring batch threshold"
            );
            self.effective_min_users = self.baseline.min_users;
        }
    }

    async fn expire_stale_members(&self) {
        let Ok(timeout) = chrono::Duration::from_std(self.baseline.user_timeout) else {
            return;
        };
        let cutoff = Utc::now() - timeout;

        let expired = match self.queue.expire_joined_before(cutoff).await {
            Ok(expired) => expired,
            Err(e) => {
                error!(error = %e, "Failed to expire stale queue members");
                return;
            }
        };

        let notification = MatchNotification::Expired {
            message: EXPIRED_MESSAGE.to_string(),
        };
        for user_id in expired {
            info!(user_id = %user_id, "Queue member expired");
            if let Err(e) = self.collaborators.notifier.notify(&user_id, &notification).await {
                warn!(user_id = %user_id, error = %e, "Failed to deliver expiry notification");
            }
        }
    }

    async fn run_round(&mut self) -> RoundReport {
        let mut report = RoundReport::default();

        let batch = match self.queue.take_batch(self.effective_min_users).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Failed to take batch from queue");
                report.error = Some(e);
                return report;
            }
        };
        report.batch_size = batch.len();

        info!(
            batch_size = batch.len(),
            min_users = self.effective_min_users,
            "Starting match round"
        );

        let result = match self.solve_batch(&batch).await {
            Ok(pairs) => self.commit_pairs(pairs, &mut report).await,
            Err(e) => Err(e),
        };

        let leftovers: Vec<QueueEntry> = match &result {
            Ok(()) => {
                let rejoin = Utc::now();
                batch
                    .iter()
                    .map(|entry| QueueEntry {
                        user_id: entry.user_id.clone(),
                        join_time: rejoin,
                    })
                    .collect()
            }
            Err(_) => batch.clone(),
        };

        match self.queue.requeue(leftovers).await {
            Ok(requeued) => report.requeued = requeued,
            Err(e) => error!(error = %e, "Failed to persist queue after re-queueing leftovers"),
        }

        if let Err(e) = result {
            error!(
                error = %e,
                code = e.error_code(),
                committed = report.committed.len(),
                "Match round failed, uncommitted members returned to queue"
            );
            report.error = Some(e);
        } else {
            info!(
                batch_size = report.batch_size,
                pairs = report.committed.len(),
                requeued = report.requeued.len(),
                "Match round finished"
            );
        }

        if self.queue.is_empty().await {
            self.restore_baseline();
        }

        report
    }

    async fn solve_batch(&self, batch: &[QueueEntry]) -> Result<Vec<MatchResult>> {
        let ids: Vec<UserId> = batch.iter().map(|entry| entry.user_id.clone()).collect();
        let mut loaded: HashMap<UserId, UserSnapshot> = self
            .collaborators
            .profiles
            .load_user_snapshots(&ids)
            .await?
            .into_iter()
            .map(|snapshot| (snapshot.id.clone(), snapshot))
            .collect();

        // batch order, so proposal order follows join order
        let mut users = Vec::with_capacity(ids.len());
        for id in &ids {
            match loaded.remove(id) {
                Some(snapshot) => users.push(snapshot),
                None => debug!(user_id = %id, "No snapshot for queued user, sitting out this round"),
            }
        }

        let (side_a, side_b, unplaced) = split_by_side(users);
        if !unplaced.is_empty() {
            debug!(count = unplaced.len(), "Users without a side sit out this round");
        }

        let builder = PreferenceListBuilder::new(
            CompatibilityScorer::new(self.settings.range_policy),
            self.collaborators.zodiac.clone(),
        );
        let prefs_a = builder.build(&side_a, &side_b).await?;
        let prefs_b = builder.build(&side_b, &side_a).await?;

        let outcome = self.solver.solve(&prefs_a, &prefs_b)?;
        Ok(outcome.pairs)
    }

    async fn commit_pairs(&self, pairs: Vec<MatchResult>, report: &mut RoundReport) -> Result<()> {
        let mut committed: HashSet<UserId> = HashSet::new();

        for pair in pairs {
            if committed.contains(&pair.user_a) || committed.contains(&pair.user_b) {
                return Err(Error::SolverInvariant(format!(
                    "pair {} / {} reuses a matched user",
                    pair.user_a, pair.user_b
                )));
            }

            if !self.queue.is_in_flight(&pair.user_a).await || !self.queue.is_in_flight(&pair.user_b).await {
                debug!(
                    user_a = %pair.user_a,
                    user_b = %pair.user_b,
                    "Member left during round, pair dropped"
                );
                report.skipped_pairs += 1;
                continue;
            }

            let conversation_id = self.collaborators.recorder.record_match(&pair).await?;
            let matched_at = Utc::now();
            info!(
                user_a = %pair.user_a,
                user_b = %pair.user_b,
                conversation_id = %conversation_id,
                "Match committed"
            );

            for (user_id, partner_id) in [(&pair.user_a, &pair.user_b), (&pair.user_b, &pair.user_a)] {
                if !self.queue.complete(user_id).await {
                    debug!(user_id = %user_id, "Member left during round, not notified");
                    continue;
                }
                let notification = MatchNotification::Matched {
                    partner_id: partner_id.clone(),
                    conversation_id: conversation_id.clone(),
                    matched_at,
                };
                if let Err(e) = self.collaborators.notifier.notify(user_id, &notification).await {
                    warn!(user_id = %user_id, error = %e, "Failed to deliver match notification");
                }
            }

            committed.insert(pair.user_a.clone());
            committed.insert(pair.user_b.clone());
            report.committed.push(CommittedPair {
                pair,
                conversation_id,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{TracingNotifier, ZodiacMatrix};
    use crate::persistence::MemoryStore;

    async fn orchestrator(min_users: usize, waiting: &[&str]) -> (Arc<MatchingQueue>, MatchOrchestrator) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MatchingQueue::new(store.clone()));
        for id in waiting {
            queue.join(id).await.unwrap();
        }
        let collaborators = Collaborators {
            profiles: store.clone(),
            zodiac: Arc::new(ZodiacMatrix::new()),
            recorder: store,
            notifier: Arc::new(TracingNotifier),
        };
        let config = ConfigHandle::fixed(AlgorithmConfig {
            min_users,
            max_wait_time: Duration::from_secs(30),
            user_timeout: Duration::from_secs(120),
        });
        let orchestrator =
            MatchOrchestrator::new(queue.clone(), collaborators, config, OrchestratorConfig::default());
        (queue, orchestrator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_below_two() {
        let (_, mut orchestrator) = orchestrator(4, &["u1"]).await;

        let outcome = orchestrator.tick().await;
        assert!(matches!(outcome, TickOutcome::Idle { queue_size: 1 }));
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
        assert!(orchestrator.wait_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_arms_timer_once() {
        let (_, mut orchestrator) = orchestrator(4, &["u1", "u2"]).await;

        let outcome = orchestrator.tick().await;
        assert!(matches!(
            outcome,
            TickOutcome::Waiting { queue_size: 2, min_users: 4 }
        ));
        let deadline = orchestrator.wait_deadline().unwrap();
        assert!(matches!(orchestrator.state(), OrchestratorState::Waiting { .. }));

        tokio::time::advance(Duration::from_secs(2)).await;
        orchestrator.tick().await;
        assert_eq!(orchestrator.wait_deadline(), Some(deadline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_halves_to_floor() {
        let (_, mut orchestrator) = orchestrator(20, &["u1", "u2", "u3"]).await;
        orchestrator.tick().await;

        let mut seen = vec![orchestrator.effective_min_users()];
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(31)).await;
            orchestrator.on_wait_timer_fired().await;
            seen.push(orchestrator.effective_min_users());
            if orchestrator.wait_deadline().is_none() {
                break;
            }
        }

        // 20 -> 10 -> 5 -> 2, re-armed while still above the queue size
        assert_eq!(seen, vec![20, 10, 5, 2]);
        assert!(orchestrator.wait_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_does_not_reduce_when_queue_caught_up() {
        let (queue, mut orchestrator) = orchestrator(4, &["u1", "u2"]).await;
        orchestrator.tick().await;

        queue.join("u3").await.unwrap();
        queue.join("u4").await.unwrap();
        orchestrator.on_wait_timer_fired().await;
        assert_eq!(orchestrator.effective_min_users(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_baseline_restored_when_queue_empty() {
        let (queue, mut orchestrator) = orchestrator(8, &["u1", "u2"]).await;
        orchestrator.tick().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        orchestrator.on_wait_timer_fired().await;
        assert_eq!(orchestrator.effective_min_users(), 4);

        queue.leave("u1").await.unwrap();
        queue.leave("u2").await.unwrap();
        assert!(matches!(orchestrator.tick().await, TickOutcome::Idle { queue_size: 0 }));
        assert_eq!(orchestrator.effective_min_users(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_change_keeps_active_reduction() {
        let (_, mut orchestrator) = orchestrator(16, &["u1", "u2"]).await;
        orchestrator.tick().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        orchestrator.on_wait_timer_fired().await;
        assert_eq!(orchestrator.effective_min_users(), 8);

        let mut config = orchestrator.baseline();
        config.min_users = 30;
        orchestrator.apply_config(config);
        assert_eq!(orchestrator.baseline().min_users, 30);
        assert_eq!(orchestrator.effective_min_users(), 8);

        config.min_users = 6;
        orchestrator.apply_config(config);
        assert_eq!(orchestrator.effective_min_users(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_change_without_reduction() {
        let (_, mut orchestrator) = orchestrator(16, &[]).await;
        let mut config = orchestrator.baseline();
        config.min_users = 12;
        orchestrator.apply_config(config);
        assert_eq!(orchestrator.effective_min_users(), 12);

        config.min_users = 0;
        orchestrator.apply_config(config);
        assert_eq!(orchestrator.effective_min_users(), MIN_BATCH_FLOOR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_without_profiles_requeues_everyone() {
        let (queue, mut orchestrator) = orchestrator(2, &["u1", "u2"]).await;

        let TickOutcome::Round(report) = orchestrator.tick().await else {
            panic!("expected a round");
        };
        assert!(report.is_success());
        assert_eq!(report.batch_size, 2);
        assert!(report.committed.is_empty());
        assert_eq!(report.requeued.len(), 2);
        assert_eq!(queue.len().await, 2);
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    }
}
