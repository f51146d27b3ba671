// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pairwise compatibility scoring.
//!
//! A score is computed from the *proposer's* point of view only: their weights,
//! their distance limit, their age limit. `score(a, b)` and `score(b, a)` are
//! generally different and that is expected.
//!
//! | Partial  | Formula                                                        |
//! |----------|----------------------------------------------------------------|
//! | distance | `10 * exp(-d / λ)`, `λ = max_distance_km / ln 10`              |
//! | interest | `10 * |A∩B| / (|A∩B| + α|A\B| + β|B\A|)`, `α = β = 0.5`        |
//! | age      | `10 * exp(-Δ / λ)`, `λ = max_age_difference / ln 10`           |
//! | zodiac   | external 12x12 table, 0 when either sign is `Unknown`          |
//!
//! The total is `Σ partial * weight / 10`, clamped to `[0, 10]`. Weights are
//! deliberately not renormalized against their sum.

use std::collections::BTreeSet;
use std::f64::consts::LN_10;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, Utc};

use crate::model::{MatchPreferences, UserSnapshot, ZodiacSign};

/// Upper bound of every partial score and of the total.
pub const MAX_SCORE: f64 = 10.0;

/// Tversky weight of features only the proposer has.
pub const TVERSKY_ALPHA: f64 = 0.5;

/// Tversky weight of features only the candidate has.
pub const TVERSKY_BETA: f64 = 0.5;

/// How candidates outside the proposer's distance/age limits are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangePolicy {
    /// Keep everyone; the exponential decay suppresses far-away candidates.
    #[default]
    SoftDecay,
    /// Drop candidates beyond `max_distance_km` or `max_age_difference`
    /// (and candidates without a location) from the proposer's list.
    HardCutoff,
}

impl fmt::Display for RangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SoftDecay => f.write_str("soft"),
            Self::HardCutoff => f.write_str("hard"),
        }
    }
}

impl FromStr for RangePolicy {
    type Err = crate::model::UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soft" | "soft_decay" => Ok(Self::SoftDecay),
            "hard" | "hard_cutoff" => Ok(Self::HardCutoff),
            _ => Err(crate::model::UnknownVariant(s.to_string())),
        }
    }
}

/// Desired gender must match in both directions.
pub fn passes_gender_filter(proposer: &UserSnapshot, candidate: &UserSnapshot) -> bool {
    proposer.preferences.desired_gender == candidate.gender
        && candidate.preferences.desired_gender == proposer.gender
}

/// Exponential decay that is 10 at `value = 0` and 1 at `value = limit`.
///
/// A non-positive limit only rewards an exact match.
pub fn decay_score(value: f64, limit: f64) -> f64 {
    if !value.is_finite() || value < 0.0 {
        return 0.0;
    }
    if limit <= 0.0 {
        return if value == 0.0 { MAX_SCORE } else { 0.0 };
    }
    let lambda = limit / LN_10;
    MAX_SCORE * (-value / lambda).exp()
}

/// Tversky similarity of two interest sets, scaled to `[0, 10]`.
pub fn interest_score(proposer: &BTreeSet<String>, candidate: &BTreeSet<String>) -> f64 {
    let shared = proposer.intersection(candidate).count() as f64;
    let only_proposer = proposer.difference(candidate).count() as f64;
    let only_candidate = candidate.difference(proposer).count() as f64;

    let denominator = shared + TVERSKY_ALPHA * only_proposer + TVERSKY_BETA * only_candidate;
    if denominator == 0.0 {
        return 0.0;
    }
    MAX_SCORE * shared / denominator
}

/// The four partial scores of one (proposer, candidate) pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PartialScores {
    /// Distance decay.
    pub distance: f64,
    /// Interest similarity.
    pub interest: f64,
    /// Age-difference decay.
    pub age: f64,
    /// Zodiac table value.
    pub zodiac: f64,
}

impl PartialScores {
    /// Weighted total using the proposer's preferences, clamped to `[0, 10]`.
    pub fn total(&self, preferences: &MatchPreferences) -> f64 {
        let weighted = self.distance * (preferences.distance_weight as f64 / 10.0)
            + self.interest * (preferences.interest_weight as f64 / 10.0)
            + self.age * (preferences.age_weight as f64 / 10.0)
            + self.zodiac * (preferences.zodiac_weight as f64 / 10.0);
        if !weighted.is_finite() {
            return 0.0;
        }
        weighted.clamp(0.0, MAX_SCORE)
    }
}

/// Scores candidates for a proposer.
///
/// Pure apart from the reference date used to turn birth dates into ages,
/// which is fixed at construction so a whole round scores against one "today".
#[derive(Debug, Clone)]
pub struct CompatibilityScorer {
    policy: RangePolicy,
    today: NaiveDate,
}

impl CompatibilityScorer {
    /// Create a scorer that computes ages as of the current UTC date.
    pub fn new(policy: RangePolicy) -> Self {
        Self::with_reference_date(policy, Utc::now().date_naive())
    }

    /// Create a scorer that computes ages as of `today`.
    pub fn with_reference_date(policy: RangePolicy, today: NaiveDate) -> Self {
        Self { policy, today }
    }

    /// The range policy in effect.
    pub fn policy(&self) -> RangePolicy {
        self.policy
    }

    /// Whether `candidate` may appear in `proposer`'s preference list at all.
    pub fn is_candidate(&self, proposer: &UserSnapshot, candidate: &UserSnapshot) -> bool {
        if proposer.id == candidate.id || !passes_gender_filter(proposer, candidate) {
            return false;
        }

        if self.policy == RangePolicy::HardCutoff {
            let prefs = &proposer.preferences;
            match (proposer.location, candidate.location) {
                (Some(from), Some(to)) if from.distance_km(&to) <= prefs.max_distance_km => {}
                _ => return false,
            }
            if let Some(diff) = self.age_difference(proposer, candidate)
                && diff > prefs.max_age_difference as f64
            {
                return false;
            }
        }

        true
    }

    /// Whether the zodiac table needs to be consulted for this pair.
    pub fn needs_zodiac(proposer: &UserSnapshot, candidate: &UserSnapshot) -> bool {
        proposer.zodiac != ZodiacSign::Unknown && candidate.zodiac != ZodiacSign::Unknown
    }

    /// Compute the partial scores. `zodiac` is the table value for
    /// (proposer sign, candidate sign) and is ignored when either sign is unknown.
    pub fn partial_scores(
        &self,
        proposer: &UserSnapshot,
        candidate: &UserSnapshot,
        zodiac: f64,
    ) -> PartialScores {
        let prefs = &proposer.preferences;

        let distance = match (proposer.location, candidate.location) {
            (Some(from), Some(to)) => decay_score(from.distance_km(&to), prefs.max_distance_km),
            _ => 0.0,
        };

        let age = self
            .age_difference(proposer, candidate)
            .map(|diff| decay_score(diff, prefs.max_age_difference as f64))
            .unwrap_or(0.0);

        let zodiac = if Self::needs_zodiac(proposer, candidate) && zodiac.is_finite() {
            zodiac.clamp(0.0, MAX_SCORE)
        } else {
            0.0
        };

        PartialScores {
            distance,
            interest: interest_score(&proposer.interests, &candidate.interests),
            age,
            zodiac,
        }
    }

    /// Total score of `candidate` from `proposer`'s point of view.
    pub fn score(&self, proposer: &UserSnapshot, candidate: &UserSnapshot, zodiac: f64) -> f64 {
        self.partial_scores(proposer, candidate, zodiac)
            .total(&proposer.preferences)
    }

    fn age_difference(&self, a: &UserSnapshot, b: &UserSnapshot) -> Option<f64> {
        let age_a = a.age_on(self.today)?;
        let age_b = b.age_on(self.today)?;
        Some((age_a as f64 - age_b as f64).abs())
    }
}
