// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborator traits.
//!
//! The engine never owns user profiles, conversations or the delivery channel.
//! It talks to them through these four traits, each injected into the runtime
//! as an `Arc<dyn ...>`.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::model::{ConversationId, MatchNotification, MatchResult, UserId, UserSnapshot, ZodiacSign};

/// Loads read-only user snapshots for a batch.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Load snapshots for the given ids.
    ///
    /// Ids without a complete profile (no profile or no preferences) are simply
    /// absent from the result.
    async fn load_user_snapshots(&self, user_ids: &[UserId]) -> Result<Vec<UserSnapshot>>;

    /// Whether the user has both a profile and matching preferences.
    async fn has_complete_profile(&self, user_id: &str) -> Result<bool> {
        let found = self.load_user_snapshots(&[user_id.to_string()]).await?;
        Ok(!found.is_empty())
    }
}

/// Pairwise zodiac compatibility lookup.
#[async_trait]
pub trait ZodiacTable: Send + Sync {
    /// Compatibility of `sign` towards `partner`, in `[0, 10]`.
    /// Pairs without an entry score 0.
    async fn compatibility(&self, sign: ZodiacSign, partner: ZodiacSign) -> Result<f64>;
}

/// Persists a committed pair and returns the conversation for it.
#[async_trait]
pub trait MatchRecorder: Send + Sync {
    /// Record the pair. Called exactly once per committed pair.
    async fn record_match(&self, pair: &MatchResult) -> Result<ConversationId>;
}

/// Delivers events to a user. Fire-and-forget from the engine's point of view.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `notification` to `user_id`.
    async fn notify(&self, user_id: &str, notification: &MatchNotification) -> Result<()>;
}

/// In-memory zodiac table.
#[derive(Debug, Clone, Default)]
pub struct ZodiacMatrix {
    scores: HashMap<(ZodiacSign, ZodiacSign), f64>,
}

impl ZodiacMatrix {
    /// Empty table; every lookup scores 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the score of `sign` towards `partner`.
    pub fn with_score(mut self, sign: ZodiacSign, partner: ZodiacSign, score: f64) -> Self {
        self.insert(sign, partner, score);
        self
    }

    /// Set the score of `sign` towards `partner`.
    pub fn insert(&mut self, sign: ZodiacSign, partner: ZodiacSign, score: f64) {
        self.scores.insert((sign, partner), score);
    }

    /// Build a table from a row-major 12x12 grid in [`ZodiacSign::SIGNS`] order.
    pub fn from_grid(grid: [[f64; 12]; 12]) -> Self {
        let mut matrix = Self::new();
        for (i, row) in grid.iter().enumerate() {
            for (j, score) in row.iter().enumerate() {
                matrix.insert(ZodiacSign::SIGNS[i], ZodiacSign::SIGNS[j], *score);
            }
        }
        matrix
    }

    /// Synchronous lookup.
    pub fn get(&self, sign: ZodiacSign, partner: ZodiacSign) -> f64 {
        self.scores.get(&(sign, partner)).copied().unwrap_or(0.0)
    }
}

#[async_trait]
impl ZodiacTable for ZodiacMatrix {
    async fn compatibility(&self, sign: ZodiacSign, partner: ZodiacSign) -> Result<f64> {
        Ok(self.get(sign, partner))
    }
}

/// Notifier that only logs. Used by the standalone host, which has no
/// delivery channel of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, user_id: &str, notification: &MatchNotification) -> Result<()> {
        let payload = serde_json::to_string(notification)?;
        info!(user_id = %user_id, payload = %payload, "Notification");
        Ok(())
    }
}
