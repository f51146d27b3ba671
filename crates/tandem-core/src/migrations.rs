// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for tandem-core.
//!
//! Hosts that bring their own pool can apply the schema before handing the
//! pool to [`SqliteStore::new`](crate::persistence::SqliteStore::new).
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use tandem_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:tandem.db?mode=rwc").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all tandem-core migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
