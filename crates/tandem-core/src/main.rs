// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tandem Core - standalone host
//!
//! Runs the matching engine against a local SQLite database. Profiles,
//! conditions and the zodiac table are read from that database; matches are
//! written to its conversation and history tables; notifications are logged.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tandem_core::collaborators::TracingNotifier;
use tandem_core::config::Config;
use tandem_core::persistence::SqliteStore;
use tandem_core::runtime::MatchingRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tandem_core=info")),
        )
        .init();

    info!("Starting Tandem Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database_path = %config.database_path.display(),
        tick_interval_ms = config.tick_interval.as_millis() as u64,
        range_policy = %config.range_policy,
        expire_stale_members = config.expire_stale_members,
        "Configuration loaded"
    );

    let store = Arc::new(SqliteStore::from_path(&config.database_path).await?);
    info!("Database ready");

    let runtime = MatchingRuntime::builder()
        .config(&config)
        .store(store.clone())
        .zodiac_table(store.clone())
        .notifier(Arc::new(TracingNotifier))
        .build()?
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    store.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
