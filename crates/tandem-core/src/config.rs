// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! This is the process-level configuration of the engine host. The matching
//! tunables (`min_users`, `max_wait_time`, `user_timeout`) are not here: they
//! live in the persisted [`AlgorithmConfig`](crate::model::AlgorithmConfig)
//! document and are refreshed by the [`config_watcher`](crate::config_watcher).

use std::path::PathBuf;
use std::time::Duration;

use crate::scoring::RangePolicy;

/// tandem-core process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file used by the standalone host
    pub database_path: PathBuf,
    /// How often the orchestrator ticks
    pub tick_interval: Duration,
    /// How often the config watcher re-reads the persisted algorithm config
    pub config_poll_interval: Duration,
    /// Distance/age handling for candidates outside the proposer's limits
    pub range_policy: RangePolicy,
    /// Expire queue members that waited longer than `user_timeout`
    pub expire_stale_members: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".data/tandem.db"),
            tick_interval: Duration::from_millis(2000),
            config_poll_interval: Duration::from_millis(5000),
            range_policy: RangePolicy::SoftDecay,
            expire_stale_members: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TANDEM_DATABASE_PATH`: SQLite file (default: `.data/tandem.db`)
    /// - `TANDEM_TICK_INTERVAL_MS`: orchestrator tick period (default: 2000)
    /// - `TANDEM_CONFIG_POLL_INTERVAL_MS`: config watcher period (default: 5000)
    /// - `TANDEM_RANGE_POLICY`: `soft` or `hard` (default: `soft`)
    /// - `TANDEM_EXPIRE_STALE_MEMBERS`: `true`/`1` to enable expiry (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_path = std::env::var("TANDEM_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let tick_interval = duration_ms_from_env("TANDEM_TICK_INTERVAL_MS", defaults.tick_interval)?;
        let config_poll_interval = duration_ms_from_env(
            "TANDEM_CONFIG_POLL_INTERVAL_MS",
            defaults.config_poll_interval,
        )?;

        let range_policy = match std::env::var("TANDEM_RANGE_POLICY") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::Invalid("TANDEM_RANGE_POLICY", "must be 'soft' or 'hard'")
            })?,
            Err(_) => defaults.range_policy,
        };

        let expire_stale_members = std::env::var("TANDEM_EXPIRE_STALE_MEMBERS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.expire_stale_members);

        Ok(Self {
            database_path,
            tick_interval,
            config_poll_interval,
            range_policy,
            expire_stale_members,
        })
    }
}

fn duration_ms_from_env(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(value) => {
            let millis: u64 = value
                .parse()
                .map_err(|_| ConfigError::Invalid(key, "must be a positive integer (milliseconds)"))?;
            if millis == 0 {
                return Err(ConfigError::Invalid(key, "must be greater than zero"));
            }
            Ok(Duration::from_millis(millis))
        }
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
