//! Store error types.

use thiserror::Error;

use super::StoreState;

/// Boxed driver error, so each backend can surface its own error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transport could not be established within the driver's own policy.
    #[error("failed to connect: {0}")]
    Connect(#[source] BoxError),

    /// The driver failed while releasing its connections.
    #[error("failed to close: {0}")]
    Close(#[source] BoxError),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] BoxError),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}")]
    MigrationDirNotFound { tried: String },

    /// The store has no live connection.
    #[error("store is not connected")]
    NotConnected,

    /// The requested operation is not valid from the current state.
    #[error("cannot {action} a store in state {from}")]
    InvalidTransition {
        from: StoreState,
        action: &'static str,
    },
}

impl StoreError {
    pub fn connect(err: impl Into<BoxError>) -> Self {
        Self::Connect(err.into())
    }

    pub fn close(err: impl Into<BoxError>) -> Self {
        Self::Close(err.into())
    }

    pub fn query(err: impl Into<BoxError>) -> Self {
        Self::Query(err.into())
    }
}
