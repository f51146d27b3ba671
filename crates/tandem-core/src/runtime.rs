// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for tandem-core.
//!
//! [`MatchingRuntime`] wires the queue, the config watcher and the orchestrator
//! together and runs them as background tasks inside the host's tokio runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tandem_core::collaborators::TracingNotifier;
//! use tandem_core::persistence::SqliteStore;
//! use tandem_core::runtime::MatchingRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::from_path(".data/tandem.db").await?);
//!
//!     let runtime = MatchingRuntime::builder()
//!         .store(store.clone())
//!         .zodiac_table(store)
//!         .notifier(Arc::new(TracingNotifier))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.join_matching("user-1").await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::collaborators::{MatchRecorder, Notifier, ProfileSource, ZodiacTable};
use crate::config::Config;
use crate::config_watcher::{ConfigHandle, ConfigWatcher};
use crate::error::Error;
use crate::model::{AlgorithmConfig, QueueEntry};
use crate::orchestrator::{Collaborators, MatchOrchestrator, OrchestratorConfig};
use crate::persistence::{ConfigStore, QueueStore};
use crate::queue::MatchingQueue;
use crate::scoring::RangePolicy;

/// Builder for creating a [`MatchingRuntime`].
pub struct MatchingRuntimeBuilder {
    queue_store: Option<Arc<dyn QueueStore>>,
    config_store: Option<Arc<dyn ConfigStore>>,
    profiles: Option<Arc<dyn ProfileSource>>,
    zodiac: Option<Arc<dyn ZodiacTable>>,
    recorder: Option<Arc<dyn MatchRecorder>>,
    notifier: Option<Arc<dyn Notifier>>,
    tick_interval: Duration,
    config_poll_interval: Duration,
    range_policy: RangePolicy,
    expire_stale_members: bool,
}

impl Default for MatchingRuntimeBuilder {
    fn default() -> Self {
        let defaults = Config::default();
        Self {
            queue_store: None,
            config_store: None,
            profiles: None,
            zodiac: None,
            recorder: None,
            notifier: None,
            tick_interval: defaults.tick_interval,
            config_poll_interval: defaults.config_poll_interval,
            range_policy: defaults.range_policy,
            expire_stale_members: defaults.expire_stale_members,
        }
    }
}

impl MatchingRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take tick, poll, range policy and expiry settings from a process [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.tick_interval = config.tick_interval;
        self.config_poll_interval = config.config_poll_interval;
        self.range_policy = config.range_policy;
        self.expire_stale_members = config.expire_stale_members;
        self
    }

    /// Use one backend for the queue, the config, profiles and the recorder.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: QueueStore + ConfigStore + ProfileSource + MatchRecorder + 'static,
    {
        self.queue_store = Some(store.clone());
        self.config_store = Some(store.clone());
        self.profiles = Some(store.clone());
        self.recorder = Some(store);
        self
    }

    /// Set the queue snapshot store (required).
    pub fn queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }

    /// Set the algorithm config store (required).
    pub fn config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Set the profile source (required).
    pub fn profiles(mut self, profiles: Arc<dyn ProfileSource>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Set the zodiac table (required).
    pub fn zodiac_table(mut self, zodiac: Arc<dyn ZodiacTable>) -> Self {
        self.zodiac = Some(zodiac);
        self
    }

    /// Set the match recorder (required).
    pub fn recorder(mut self, recorder: Arc<dyn MatchRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Set the notifier (required).
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the orchestrator tick interval.
    ///
    /// Default: 2 seconds
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the config watcher poll interval.
    ///
    /// Default: 5 seconds
    pub fn config_poll_interval(mut self, interval: Duration) -> Self {
        self.config_poll_interval = interval;
        self
    }

    /// Set the range policy.
    ///
    /// Default: [`RangePolicy::SoftDecay`]
    pub fn range_policy(mut self, policy: RangePolicy) -> Self {
        self.range_policy = policy;
        self
    }

    /// Enable or disable per-member timeout expiry.
    ///
    /// Default: disabled
    pub fn expire_stale_members(mut self, enabled: bool) -> Self {
        self.expire_stale_members = enabled;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<MatchingRuntimeConfig> {
        let queue_store = self
            .queue_store
            .ok_or_else(|| anyhow::anyhow!("queue_store is required"))?;
        let config_store = self
            .config_store
            .ok_or_else(|| anyhow::anyhow!("config_store is required"))?;
        let profiles = self
            .profiles
            .ok_or_else(|| anyhow::anyhow!("profiles is required"))?;
        let zodiac = self
            .zodiac
            .ok_or_else(|| anyhow::anyhow!("zodiac_table is required"))?;
        let recorder = self
            .recorder
            .ok_or_else(|| anyhow::anyhow!("recorder is required"))?;
        let notifier = self
            .notifier
            .ok_or_else(|| anyhow::anyhow!("notifier is required"))?;

        if self.tick_interval.is_zero() || self.config_poll_interval.is_zero() {
            anyhow::bail!("tick_interval and config_poll_interval must be greater than zero");
        }

        Ok(MatchingRuntimeConfig {
            queue_store,
            config_store,
            collaborators: Collaborators {
                profiles,
                zodiac,
                recorder,
                notifier,
            },
            config_poll_interval: self.config_poll_interval,
            settings: OrchestratorConfig {
                tick_interval: self.tick_interval,
                range_policy: self.range_policy,
                expire_stale_members: self.expire_stale_members,
            },
        })
    }
}

/// Configuration for a [`MatchingRuntime`].
pub struct MatchingRuntimeConfig {
    queue_store: Arc<dyn QueueStore>,
    config_store: Arc<dyn ConfigStore>,
    collaborators: Collaborators,
    config_poll_interval: Duration,
    settings: OrchestratorConfig,
}

impl MatchingRuntimeConfig {
    /// Restore the queue, load the config and spawn the background tasks.
    pub async fn start(self) -> Result<MatchingRuntime> {
        let queue = Arc::new(MatchingQueue::restore(self.queue_store).await?);

        let watcher = ConfigWatcher::initialize(self.config_store, self.config_poll_interval).await;
        let config = watcher.subscribe();
        let watcher_shutdown = watcher.shutdown_handle();

        let profiles = self.collaborators.profiles.clone();
        let orchestrator =
            MatchOrchestrator::new(queue.clone(), self.collaborators, config.clone(), self.settings);
        let orchestrator_shutdown = orchestrator.shutdown_handle();

        let watcher_handle = tokio::spawn(watcher.run());
        let orchestrator_handle = tokio::spawn(orchestrator.run());

        info!(queue_size = queue.len().await, "MatchingRuntime started");

        Ok(MatchingRuntime {
            queue,
            profiles,
            config,
            orchestrator_handle,
            orchestrator_shutdown,
            watcher_handle,
            watcher_shutdown,
        })
    }
}

/// A running matching engine.
pub struct MatchingRuntime {
    queue: Arc<MatchingQueue>,
    profiles: Arc<dyn ProfileSource>,
    config: ConfigHandle,
    orchestrator_handle: JoinHandle<()>,
    orchestrator_shutdown: Arc<Notify>,
    watcher_handle: JoinHandle<()>,
    watcher_shutdown: Arc<Notify>,
}

impl MatchingRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> MatchingRuntimeBuilder {
        MatchingRuntimeBuilder::new()
    }

    /// Start searching for `user_id`.
    ///
    /// Fails with [`Error::IncompleteProfile`] if the user has no profile or no
    /// matching preferences. Returns `false` if the user is already searching.
    pub async fn join_matching(&self, user_id: &str) -> crate::error::Result<bool> {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }
        if !self.profiles.has_complete_profile(user_id).await? {
            return Err(Error::IncompleteProfile {
                user_id: user_id.to_string(),
            });
        }
        self.queue.join(user_id).await
    }

    /// Stop searching for `user_id`. Honored even mid-round.
    pub async fn leave_matching(&self, user_id: &str) -> crate::error::Result<bool> {
        self.queue.leave(user_id).await
    }

    /// Waiting members, oldest first.
    pub async fn queue_snapshot(&self) -> Vec<QueueEntry> {
        self.queue.snapshot().await
    }

    /// Whether `user_id` is waiting or part of the round in progress.
    pub async fn is_searching(&self, user_id: &str) -> bool {
        self.queue.contains(user_id).await || self.queue.is_in_flight(user_id).await
    }

    /// The persisted baseline config currently in effect.
    pub fn algorithm_config(&self) -> AlgorithmConfig {
        self.config.current()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the orchestrator and the config watcher to stop, then waits for
    /// them. A round already in progress finishes first.
    pub async fn shutdown(self) -> Result<()> {
        info!("MatchingRuntime shutting down...");

        self.orchestrator_shutdown.notify_one();
        self.watcher_shutdown.notify_one();

        if let Err(e) = self.orchestrator_handle.await {
            error!("Match orchestrator task panicked: {}", e);
            return Err(anyhow::anyhow!("orchestrator task panicked: {}", e));
        }
        if let Err(e) = self.watcher_handle.await {
            error!("Config watcher task panicked: {}", e);
            return Err(anyhow::anyhow!("config watcher task panicked: {}", e));
        }

        info!("MatchingRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.orchestrator_handle.is_finished() && !self.watcher_handle.is_finished()
    }
}
