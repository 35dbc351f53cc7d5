//! Error types for the mail aggregator.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Poll error: {0}")]
    Poll(#[from] PollError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Crash-recovery journal errors.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Failed to open journal at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Journal IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal query failed: {0}")]
    Query(String),

    #[error("Journal entry is corrupt: {0}")]
    Corrupt(String),

    #[error(
        "Journal at {path} was left mid-write by the previous process; inspect and remove it before restarting"
    )]
    UncleanShutdown { path: PathBuf },
}

impl From<libsql::Error> for JournalError {
    fn from(e: libsql::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Failures reported by the protocol clients while polling a mailbox.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Poll timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed for {address}: {reason}")]
    AuthFailed { address: String, reason: String },

    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Poll cancelled")]
    Cancelled,
}

/// Failures of the billing, directory, alert and notification collaborators.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the aggregator.
pub type Result<T> = std::result::Result<T, Error>;
