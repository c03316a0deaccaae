//! Error types for database lifecycle operations.
//!
//! Provides a unified error type covering statement execution, transaction
//! control, guarded upgrades, JSON import/export and the injected file,
//! cipher and secret collaborators.

use std::fmt;

use thiserror::Error;
use versioned_db_core::ValidationError;

/// Which transaction primitive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    /// `BEGIN`.
    Begin,
    /// `COMMIT`.
    Commit,
    /// `ROLLBACK`.
    Rollback,
}

impl fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionStage::Begin => "begin",
            TransactionStage::Commit => "commit",
            TransactionStage::Rollback => "rollback",
        })
    }
}

/// Which step of [`Database::delete_database`](crate::Database::delete_database) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStep {
    /// Opening the database to release it cleanly.
    Open,
    /// Closing the connection.
    Close,
    /// Removing the file.
    Remove,
}

impl fmt::Display for DeleteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeleteStep::Open => "open",
            DeleteStep::Close => "close",
            DeleteStep::Remove => "remove",
        })
    }
}

/// Errors that can occur during database lifecycle operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An operation needed an open connection and there was none.
    #[error("database '{0}' is not open")]
    NotOpen(String),

    /// SQLite failure while performing a named operation.
    #[error("{operation} failed: {source}")]
    Sql {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// A transaction primitive failed.
    #[error("transaction {stage} failed: {source}")]
    Transaction {
        stage: TransactionStage,
        #[source]
        source: rusqlite::Error,
    },

    /// The body of a transaction failed and so did the rollback.
    #[error("{cause} (rollback also failed: {rollback})")]
    RollbackFailed {
        #[source]
        cause: Box<StoreError>,
        rollback: rusqlite::Error,
    },

    /// An upgrade step failed; the database was restored from its snapshot.
    #[error("upgrade to version {version} failed: {source}")]
    UpgradeFailed {
        version: i64,
        #[source]
        source: Box<StoreError>,
    },

    /// Taking the pre-upgrade snapshot failed; no schema change was made.
    #[error("backup of '{name}' failed: {source}")]
    BackupFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Restoring the snapshot after a failed upgrade failed. The live file
    /// may be corrupt and needs manual intervention.
    #[error("restore of '{name}' failed after {upgrade}: {source}")]
    RestoreFailed {
        name: String,
        upgrade: Box<StoreError>,
        #[source]
        source: std::io::Error,
    },

    /// Opening the database failed; the connection is closed.
    #[error("open of '{name}' failed: {source}")]
    OpenFailed {
        name: String,
        #[source]
        source: Box<StoreError>,
    },

    /// A document failed validation before import.
    #[error("invalid import document: {}", join_errors(.0))]
    InvalidImport(Vec<ValidationError>),

    /// An exported document failed validation.
    #[error("invalid export document: {}", join_errors(.0))]
    InvalidExport(Vec<ValidationError>),

    /// The configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(ValidationError),

    /// No file path can be derived for the database name.
    #[error("cannot resolve a file path for database '{0}'")]
    PathResolution(String),

    /// A file operation failed.
    #[error("file operation '{operation}' failed for '{name}': {source}")]
    File {
        operation: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The cipher collaborator failed.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// The secret store failed or has no secret.
    #[error("secret error: {0}")]
    Secret(String),

    /// Deleting the database failed at the named step.
    #[error("delete of '{name}' failed at {step}: {source}")]
    Delete {
        name: String,
        step: DeleteStep,
        #[source]
        source: Box<StoreError>,
    },

    /// A read-only query was given a statement that writes.
    #[error("statement is not read-only: {0}")]
    NotReadOnly(String),

    /// A sync date was not a valid RFC 3339 timestamp.
    #[error("invalid sync date '{0}'")]
    InvalidSyncDate(String),

    /// SQL-to-document conversion failure.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// JSON parsing or serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Wraps a SQLite error with the name of the operation that raised it.
    pub(crate) fn sql(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
        move |source| StoreError::Sql { operation, source }
    }

    /// Returns `true` if a failed restore appears anywhere in the chain.
    ///
    /// This is the one terminal condition: every other error leaves the
    /// database either untouched or rolled back to its snapshot.
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            StoreError::RestoreFailed { .. } => true,
            StoreError::OpenFailed { source, .. }
            | StoreError::UpgradeFailed { source, .. }
            | StoreError::Delete { source, .. } => source.is_unrecoverable(),
            StoreError::RollbackFailed { cause, .. } => cause.is_unrecoverable(),
            _ => false,
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias for results with [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;
