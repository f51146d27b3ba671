// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tandem-core.
//!
//! Nothing in here is ever surfaced to an end user by the matching loop itself;
//! the orchestrator logs these and retries on its next tick. The only callers
//! that see them directly are hosts using [`crate::runtime::MatchingRuntime`].

use thiserror::Error;

/// Result type using the tandem-core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the matching engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Process configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migrations failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A durable store operation failed.
    #[error("Persistence error during '{operation}': {details}")]
    Persistence {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// An external collaborator (profiles, zodiac table, recorder, notifier) failed.
    #[error("{collaborator} failed: {details}")]
    Collaborator {
        /// Which collaborator failed.
        collaborator: &'static str,
        /// Error details.
        details: String,
    },

    /// The user has no profile or no matching preferences yet.
    #[error("User '{user_id}' must complete their profile and matching preferences first")]
    IncompleteProfile {
        /// The user that tried to join.
        user_id: String,
    },

    /// The solver produced an inconsistent pairing.
    #[error("Solver invariant violated: {0}")]
    SolverInvariant(String),

    /// The runtime has already been shut down.
    #[error("Matching runtime is shut down")]
    Shutdown,
}

impl Error {
    /// Shorthand for a persistence failure.
    pub fn persistence(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Persistence {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Shorthand for a collaborator failure.
    pub fn collaborator(collaborator: &'static str, details: impl ToString) -> Self {
        Self::Collaborator {
            collaborator,
            details: details.to_string(),
        }
    }

    /// Get the stable error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Persistence { .. } => "PERSISTENCE_ERROR",
            Self::Collaborator { .. } => "COLLABORATOR_ERROR",
            Self::IncompleteProfile { .. } => "INCOMPLETE_PROFILE",
            Self::SolverInvariant(_) => "SOLVER_INVARIANT",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}
