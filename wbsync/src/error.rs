//! Error types for wbsync
//!
//! Fetch failures are typed in [`crate::services::fetch_client::FetchError`];
//! this module holds the storage and run-level errors.

use thiserror::Error;

/// Storage layer error
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened or did not answer a ping
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// A batch transaction for one indicator was aborted
    #[error("Transaction aborted for indicator {indicator}: {source}")]
    Transaction {
        indicator: String,
        #[source]
        source: sqlx::Error,
    },

    /// Any other database failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (e.g. creating the database folder)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-level error returned by the orchestrator
///
/// Only invalid input and an unreachable store at run start surface here;
/// every other failure is reported per indicator in the run outcome.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid input range or settings (fails fast, never retried)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Fatal store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// wbsync-common error
    #[error("Common error: {0}")]
    Common(#[from] wbsync_common::Error),
}

/// Result type for run-level operations
pub type SyncResult<T> = Result<T, SyncError>;
