// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by the scorer, solver, queue and orchestrator.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user identifier.
pub type UserId = String;

/// Opaque conversation identifier returned by the match recorder.
pub type ConversationId = String;

/// Smallest batch size the orchestrator will ever run with.
pub const MIN_BATCH_FLOOR: usize = 2;

/// Gender as stored on profiles and in matching preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    /// Male.
    Male,
    /// Female.
    Female,
    /// Anything else.
    Another,
}

impl Gender {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Another => "another",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            "another" => Ok(Self::Another),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Western zodiac sign. `Unknown` never scores.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ZodiacSign {
    Aries,
    Taurus,
    Gemini,
    Cancer,
    Leo,
    Virgo,
    Libra,
    Scorpio,
    Sagittarius,
    Capricorn,
    Aquarius,
    Pisces,
    #[default]
    Unknown,
}

impl ZodiacSign {
    /// The twelve real signs, in table order.
    pub const SIGNS: [ZodiacSign; 12] = [
        Self::Aries,
        Self::Taurus,
        Self::Gemini,
        Self::Cancer,
        Self::Leo,
        Self::Virgo,
        Self::Libra,
        Self::Scorpio,
        Self::Sagittarius,
        Self::Capricorn,
        Self::Aquarius,
        Self::Pisces,
    ];

    /// Row/column index into a 12x12 compatibility table, `None` for `Unknown`.
    pub fn index(&self) -> Option<usize> {
        Self::SIGNS.iter().position(|sign| sign == self)
    }

    /// Canonical capitalized name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aries => "Aries",
            Self::Taurus => "Taurus",
            Self::Gemini => "Gemini",
            Self::Cancer => "Cancer",
            Self::Leo => "Leo",
            Self::Virgo => "Virgo",
            Self::Libra => "Libra",
            Self::Scorpio => "Scorpio",
            Self::Sagittarius => "Sagittarius",
            Self::Capricorn => "Capricorn",
            Self::Aquarius => "Aquarius",
            Self::Pisces => "Pisces",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ZodiacSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZodiacSign {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "Unknown" {
            return Ok(Self::Unknown);
        }
        Self::SIGNS
            .iter()
            .copied()
            .find(|sign| sign.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Returned when parsing a [`Gender`] or [`ZodiacSign`] from an unrecognized string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant '{0}'")]
pub struct UnknownVariant(pub String);

/// A point on earth, longitude first (GeoJSON order).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Longitude in degrees.
    pub lon: f64,
    /// Latitude in degrees.
    pub lat: f64,
}

impl GeoPoint {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    /// Create a point from longitude and latitude.
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Great-circle (haversine) distance in kilometres.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        Self::EARTH_RADIUS_KM * c
    }
}

/// A user's matching preferences ("conditions").
///
/// Weights are small non-negative integers. Nothing forces them to sum to 10;
/// the scorer divides each weight by 10 regardless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPreferences {
    /// Gender this user wants to be matched with.
    pub desired_gender: Gender,
    /// Distance at which the distance score has decayed to 1.
    pub max_distance_km: f64,
    /// Weight of the interest score.
    pub interest_weight: u32,
    /// Weight of the distance score.
    pub distance_weight: u32,
    /// Weight of the zodiac score.
    pub zodiac_weight: u32,
    /// Weight of the age score.
    pub age_weight: u32,
    /// Age difference (years) at which the age score has decayed to 1.
    pub max_age_difference: u32,
}

impl Default for MatchPreferences {
    fn default() -> Self {
        Self {
            desired_gender: Gender::Another,
            max_distance_km: 10.0,
            interest_weight: 4,
            distance_weight: 2,
            zodiac_weight: 2,
            age_weight: 2,
            max_age_difference: 2,
        }
    }
}

/// Read-only projection of one user at match time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    /// User id.
    pub id: UserId,
    /// The user's own gender.
    pub gender: Gender,
    /// Last known location, if shared.
    pub location: Option<GeoPoint>,
    /// Date of birth, if known.
    pub birth_date: Option<NaiveDate>,
    /// Zodiac sign.
    pub zodiac: ZodiacSign,
    /// Interest ids.
    pub interests: BTreeSet<String>,
    /// Matching preferences.
    pub preferences: MatchPreferences,
}

impl UserSnapshot {
    /// Age in whole years on the given date. `None` without a birth date.
    pub fn age_on(&self, today: NaiveDate) -> Option<u32> {
        let birth = self.birth_date?;
        let mut age = today.year() - birth.year();
        if (today.month(), today.day()) < (birth.month(), birth.day()) {
            age -= 1;
        }
        Some(age.max(0) as u32)
    }
}

/// A scored edge in one user's ranked preference list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReference {
    /// The candidate being ranked.
    pub candidate_id: UserId,
    /// Score the owner of the list assigns to the candidate.
    pub score: f64,
}

/// One user's ranked preference list, best candidate first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PreferenceList {
    /// Owner of the list.
    pub user_id: UserId,
    /// Candidates sorted by score descending, ties in insertion order.
    pub references: Vec<CandidateReference>,
}

/// A user waiting in the matching queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The waiting user.
    pub user_id: UserId,
    /// When the user (re)started waiting.
    pub join_time: DateTime<Utc>,
}

/// An unordered pair, stored with the lexicographically smaller id first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchResult {
    /// The smaller of the two ids.
    pub user_a: UserId,
    /// The larger of the two ids.
    pub user_b: UserId,
}

impl MatchResult {
    /// Build a canonical pair from two ids in any order.
    pub fn new(first: impl Into<UserId>, second: impl Into<UserId>) -> Self {
        let (first, second) = (first.into(), second.into());
        if first <= second {
            Self {
                user_a: first,
                user_b: second,
            }
        } else {
            Self {
                user_a: second,
                user_b: first,
            }
        }
    }

    /// Whether `user_id` is one side of this pair.
    pub fn contains(&self, user_id: &str) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    /// The other member of the pair, if `user_id` is a member.
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if self.user_a == user_id {
            Some(&self.user_b)
        } else if self.user_b == user_id {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

/// Tunables of the batch orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmConfig {
    /// Queue size required before a round runs; also the batch size.
    pub min_users: usize,
    /// How long the queue may sit below `min_users` before the threshold is halved.
    pub max_wait_time: Duration,
    /// How long a member may wait before being expired (when expiry is enabled).
    pub user_timeout: Duration,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            min_users: 20,
            max_wait_time: Duration::from_secs(30),
            user_timeout: Duration::from_secs(120),
        }
    }
}

impl AlgorithmConfig {
    /// Clamp `min_users` to the batch floor.
    pub fn normalized(mut self) -> Self {
        self.min_users = self.min_users.max(MIN_BATCH_FLOOR);
        self
    }
}

/// Payload delivered to a user through the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MatchNotification {
    /// The user was paired.
    Matched {
        /// The other member of the pair.
        partner_id: UserId,
        /// Conversation created (or reused) for the pair.
        conversation_id: ConversationId,
        /// When the pair was committed.
        matched_at: DateTime<Utc>,
    },
    /// The user waited longer than the per-member timeout and was removed.
    Expired {
        /// Human-readable explanation.
        message: String,
    },
}
