// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tandem Core - Stable-Matching Engine
//!
//! This crate pairs users of a dating app. It scores pairwise compatibility
//! under per-user weighted preferences, runs a propose/reject stable matching
//! over batches of waiting users, and keeps a durable matching queue that
//! decides when a batch runs.
//!
//! Profiles, conversations and real-time delivery belong to the host. The
//! engine reaches them through the traits in [`collaborators`].
//!
//! # Architecture
//!
//! ```text
//!   join / leave                                      ┌──────────────────┐
//! ─────────────────▶ ┌───────────────┐   snapshot     │   QueueStore     │
//!                    │ MatchingQueue │ ─────────────▶ │ (SQLite/memory)  │
//!                    └───────┬───────┘                └──────────────────┘
//!                            │ take_batch / requeue
//!                            ▼
//! ┌──────────────┐   ┌───────────────────┐   load_user_snapshots  ┌───────────────┐
//! │ConfigWatcher │──▶│ MatchOrchestrator │ ─────────────────────▶ │ ProfileSource │
//! │ (watch chan) │   │  Idle/Waiting/Run │                        └───────────────┘
//! └──────────────┘   └─────────┬─────────┘
//!                              │
//!              ┌───────────────┼─────────────────┐
//!              ▼               ▼                 ▼
//!   ┌─────────────────────┐ ┌───────────────┐ ┌─────────────────┐
//!   │PreferenceListBuilder│ │ StableMatcher │ │  MatchRecorder  │
//!   │ CompatibilityScorer │ └───────────────┘ │    Notifier     │
//!   │     ZodiacTable     │                   └─────────────────┘
//!   └─────────────────────┘
//! ```
//!
//! # Scoring
//!
//! Scores are computed from the proposer's side only and are not symmetric.
//! Candidates must pass a bidirectional desired-gender filter. Each partial
//! score lies in `[0, 10]`; the total is `Σ partial * weight / 10`, clamped.
//!
//! | Partial | Source |
//! |---------|--------|
//! | distance | exponential decay, 1 at `max_distance_km` |
//! | interest | Tversky index, `α = β = 0.5` |
//! | age | exponential decay, 1 at `max_age_difference` |
//! | zodiac | external 12x12 table |
//!
//! # Orchestrator
//!
//! | Condition | Action |
//! |-----------|--------|
//! | queue < 2 | idle, cancel the waiting timer |
//! | 2 <= queue < `min_users` | wait; after `max_wait_time` halve `min_users` (floor 2) |
//! | queue >= `min_users` | pop the oldest `min_users`, match, commit, re-queue leftovers |
//! | queue == 0 | restore `min_users` to the configured baseline |
//!
//! # Configuration
//!
//! Process configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TANDEM_DATABASE_PATH` | No | `.data/tandem.db` | SQLite file of the standalone host |
//! | `TANDEM_TICK_INTERVAL_MS` | No | `2000` | Orchestrator tick period |
//! | `TANDEM_CONFIG_POLL_INTERVAL_MS` | No | `5000` | Config watcher poll period |
//! | `TANDEM_RANGE_POLICY` | No | `soft` | `soft` or `hard` distance/age handling |
//! | `TANDEM_EXPIRE_STALE_MEMBERS` | No | `false` | Expire members after `user_timeout` |
//!
//! The matching tunables (`min_users`, `max_wait_time`, `user_timeout`) live in
//! the persisted [`AlgorithmConfig`](model::AlgorithmConfig) document.
//!
//! # Modules
//!
//! - [`model`]: Shared data types
//! - [`scoring`]: Compatibility scorer
//! - [`preferences`]: Preference list builder
//! - [`solver`]: Stable matching solver
//! - [`queue`]: Durable matching queue
//! - [`orchestrator`]: Batch orchestrator
//! - [`config_watcher`]: Algorithm config refresh
//! - [`collaborators`]: Traits for host-provided services
//! - [`persistence`]: Queue/config stores (SQLite, in-memory)
//! - [`runtime`]: Embeddable runtime
//! - [`config`]: Process configuration
//! - [`error`]: Error types

#![deny(missing_docs)]

pub mod collaborators;
pub mod config;
pub mod config_watcher;
pub mod error;
pub mod migrations;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod preferences;
pub mod queue;
pub mod runtime;
pub mod scoring;
pub mod solver;

pub use error::{Error, Result};
pub use runtime::MatchingRuntime;
