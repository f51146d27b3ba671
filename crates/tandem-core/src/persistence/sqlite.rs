// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Besides the two engine documents this store carries the read-side tables
//! (profiles, match conditions, zodiac table) and the conversation/match
//! history tables, so the standalone host can run without any other service.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ConfigStore, QueueStore};
use crate::collaborators::{MatchRecorder, ProfileSource, ZodiacTable};
use crate::error::{Error, Result};
use crate::migrations;
use crate::model::{
    AlgorithmConfig, ConversationId, Gender, GeoPoint, MatchPreferences, MatchResult, QueueEntry,
    UserId, UserSnapshot, ZodiacSign,
};

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

/// One row of the match history table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MatchHistoryRecord {
    /// Smaller user id of the pair.
    pub user_a: String,
    /// Larger user id of the pair.
    pub user_b: String,
    /// Conversation the pair was given.
    pub conversation_id: String,
    /// When the pair was recorded.
    pub matched_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    user_id: String,
    gender: String,
    lon: Option<f64>,
    lat: Option<f64>,
    // decoded by hand so one bad date only drops its own row
    birth_date: Option<String>,
    zodiac: String,
    interests: String,
    desired_gender: String,
    max_distance_km: f64,
    interest_weight: i64,
    distance_weight: i64,
    zodiac_weight: i64,
    age_weight: i64,
    max_age_difference: i64,
}

impl TryFrom<SnapshotRow> for UserSnapshot {
    type Error = Error;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        let invalid = |what: &str, value: &str| {
            Error::persistence(
                "load_user_snapshots",
                format!("user '{}' has invalid {} '{}'", row.user_id, what, value),
            )
        };

        let gender: Gender = row.gender.parse().map_err(|_| invalid("gender", &row.gender))?;
        let desired_gender: Gender = row
            .desired_gender
            .parse()
            .map_err(|_| invalid("desired_gender", &row.desired_gender))?;
        // Unrecognized signs never score, same as a missing sign
        let zodiac = row.zodiac.parse().unwrap_or(ZodiacSign::Unknown);
        let interests: BTreeSet<String> =
            serde_json::from_str(&row.interests).map_err(|_| invalid("interests", &row.interests))?;
        let birth_date = match row.birth_date.as_deref() {
            Some(raw) => Some(
                raw.parse::<NaiveDate>()
                    .map_err(|_| invalid("birth_date", raw))?,
            ),
            None => None,
        };
        let location = match (row.lon, row.lat) {
            (Some(lon), Some(lat)) => Some(GeoPoint::new(lon, lat)),
            _ => None,
        };

        Ok(UserSnapshot {
            id: row.user_id.clone(),
            gender,
            location,
            birth_date,
            zodiac,
            interests,
            preferences: MatchPreferences {
                desired_gender,
                max_distance_km: row.max_distance_km,
                interest_weight: non_negative(row.interest_weight),
                distance_weight: non_negative(row.distance_weight),
                zodiac_weight: non_negative(row.zodiac_weight),
                age_weight: non_negative(row.age_weight),
                max_age_difference: non_negative(row.max_age_difference),
            },
        })
    }
}

/// Ids bound per `IN (...)` query, well under SQLite's bound-parameter limit.
const SNAPSHOT_CHUNK: usize = 500;

fn non_negative(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn duration_from_ms(value: i64) -> Duration {
    Duration::from_millis(u64::try_from(value).unwrap_or(0))
}

fn duration_to_ms(value: Duration) -> i64 {
    i64::try_from(value.as_millis()).unwrap_or(i64::MAX)
}

impl SqliteStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::persistence(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                Error::persistence(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace a user's profile and matching preferences.
    pub async fn upsert_user_snapshot(&self, user: &UserSnapshot) -> Result<()> {
        let interests = serde_json::to_string(&user.interests)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, gender, lon, lat, birth_date, zodiac, interests)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                gender = excluded.gender,
                lon = excluded.lon,
                lat = excluded.lat,
                birth_date = excluded.birth_date,
                zodiac = excluded.zodiac,
                interests = excluded.interests
            "#,
        )
        .bind(&user.id)
        .bind(user.gender.as_str())
        .bind(user.location.map(|p| p.lon))
        .bind(user.location.map(|p| p.lat))
        .bind(user.birth_date)
        .bind(user.zodiac.as_str())
        .bind(&interests)
        .execute(&mut *tx)
        .await?;

        let prefs = &user.preferences;
        sqlx::query(
            r#"
            INSERT INTO match_conditions (
                user_id, desired_gender, max_distance_km, interest_weight,
                distance_weight, zodiac_weight, age_weight, max_age_difference
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                desired_gender = excluded.desired_gender,
                max_distance_km = excluded.max_distance_km,
                interest_weight = excluded.interest_weight,
                distance_weight = excluded.distance_weight,
                zodiac_weight = excluded.zodiac_weight,
                age_weight = excluded.age_weight,
                max_age_difference = excluded.max_age_difference
            "#,
        )
        .bind(&user.id)
        .bind(prefs.desired_gender.as_str())
        .bind(prefs.max_distance_km)
        .bind(prefs.interest_weight as i64)
        .bind(prefs.distance_weight as i64)
        .bind(prefs.zodiac_weight as i64)
        .bind(prefs.age_weight as i64)
        .bind(prefs.max_age_difference as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Set one cell of the zodiac table.
    pub async fn set_zodiac_compatibility(
        &self,
        sign: ZodiacSign,
        partner: ZodiacSign,
        score: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zodiac_compatibility (sign, partner_sign, score)
            VALUES (?, ?, ?)
            ON CONFLICT(sign, partner_sign) DO UPDATE SET score = excluded.score
            "#,
        )
        .bind(sign.as_str())
        .bind(partner.as_str())
        .bind(score)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Match history rows involving `user_id`, oldest first.
    pub async fn match_history_for(&self, user_id: &str) -> Result<Vec<MatchHistoryRecord>> {
        let records = sqlx::query_as::<_, MatchHistoryRecord>(
            r#"
            SELECT user_a, user_b, conversation_id, matched_at
            FROM match_history
            WHERE user_a = ? OR user_b = ?
            ORDER BY id ASC
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn save_queue_snapshot(&self, entries: &[QueueEntry]) -> Result<()> {
        let document = serde_json::to_string(entries)?;

        sqlx::query(
            r#"
            INSERT INTO matching_queue (id, entries, updated_at)
            VALUES (1, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                entries = excluded.entries,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&document)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_queue_snapshot(&self) -> Result<Vec<QueueEntry>> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT entries FROM matching_queue WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        match document {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn load_algorithm_config(&self) -> Result<Option<AlgorithmConfig>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT min_users, max_wait_time_ms, user_timeout_ms FROM algorithm_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(min_users, max_wait_time_ms, user_timeout_ms)| {
            AlgorithmConfig {
                min_users: usize::try_from(min_users).unwrap_or(0),
                max_wait_time: duration_from_ms(max_wait_time_ms),
                user_timeout: duration_from_ms(user_timeout_ms),
            }
            .normalized()
        }))
    }

    async fn save_algorithm_config(&self, config: &AlgorithmConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO algorithm_config (id, min_users, max_wait_time_ms, user_timeout_ms, updated_at)
            VALUES (1, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                min_users = excluded.min_users,
                max_wait_time_ms = excluded.max_wait_time_ms,
                user_timeout_ms = excluded.user_timeout_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(i64::try_from(config.min_users).unwrap_or(i64::MAX))
        .bind(duration_to_ms(config.max_wait_time))
        .bind(duration_to_ms(config.user_timeout))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ProfileSource for SqliteStore {
    async fn load_user_snapshots(&self, user_ids: &[UserId]) -> Result<Vec<UserSnapshot>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows: Vec<SnapshotRow> = Vec::with_capacity(user_ids.len());
        for chunk in user_ids.chunks(SNAPSHOT_CHUNK) {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                r#"
                SELECT p.user_id, p.gender, p.lon, p.lat, p.birth_date, p.zodiac, p.interests,
                       c.desired_gender, c.max_distance_km, c.interest_weight, c.distance_weight,
                       c.zodiac_weight, c.age_weight, c.max_age_difference
                FROM profiles p
                JOIN match_conditions c ON c.user_id = p.user_id
                WHERE p.user_id IN (
                "#,
            );
            let mut ids = query.separated(", ");
            for id in chunk {
                ids.push_bind(id);
            }
            ids.push_unseparated(")");

            rows.extend(query.build_query_as::<SnapshotRow>().fetch_all(&self.pool).await?);
        }

        let found = rows.len();
        let snapshots: Vec<UserSnapshot> = rows
            .into_iter()
            .filter_map(|row| match UserSnapshot::try_from(row) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable user snapshot");
                    None
                }
            })
            .collect();
        debug!(
            requested = user_ids.len(),
            found,
            skipped = found - snapshots.len(),
            "Loaded user snapshots"
        );

        Ok(snapshots)
    }
}

#[async_trait]
impl ZodiacTable for SqliteStore {
    async fn compatibility(&self, sign: ZodiacSign, partner: ZodiacSign) -> Result<f64> {
        let score: Option<f64> = sqlx::query_scalar(
            "SELECT score FROM zodiac_compatibility WHERE sign = ? AND partner_sign = ?",
        )
        .bind(sign.as_str())
        .bind(partner.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(score.unwrap_or(0.0))
    }
}

#[async_trait]
impl MatchRecorder for SqliteStore {
    async fn record_match(&self, pair: &MatchResult) -> Result<ConversationId> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT conversation_id FROM conversations WHERE user_a = ? AND user_b = ?",
        )
        .bind(&pair.user_a)
        .bind(&pair.user_b)
        .fetch_optional(&mut *tx)
        .await?;

        let conversation_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO conversations (conversation_id, user_a, user_b, created_at)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(&pair.user_a)
                .bind(&pair.user_b)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                id
            }
        };

        sqlx::query(
            r#"
            INSERT INTO match_history (user_a, user_b, conversation_id, matched_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&pair.user_a)
        .bind(&pair.user_b)
        .bind(&conversation_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(conversation_id)
    }
}
