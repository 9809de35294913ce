// src/cache/errors.rs
// Error type shared by every tag index backend

use thiserror::Error;

/// Result type for tag index operations
pub type TagIndexResult<T> = Result<T, TagIndexError>;

/// Coarse classification of a [`TagIndexError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backend unreachable, connection dropped or request timed out
    Transport,
    /// Some commands of a pipelined batch failed while others applied
    PartialBatch,
    /// Malformed tag, query id, table name or payload
    InvalidInput,
    /// Anything the backend itself reported
    Backend,
}

#[derive(Debug, Error)]
pub enum TagIndexError {
    // Backends
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{failed} of {total} commands failed in {operation} batch: {detail}")]
    PartialBatch {
        operation: &'static str,
        failed: usize,
        total: usize,
        detail: String,
    },

    #[error("Blocking database task failed: {0}")]
    Join(String),

    // Input
    #[error("Invalid cache tag {0:?}: tags must be non-empty and contain no whitespace")]
    InvalidTag(String),

    #[error("Invalid query id: query ids must be non-empty")]
    InvalidQueryId,

    #[error(
        "Invalid table name: {0}. Table names must start with a letter, underscore, or dollar sign \
         and contain only letters, digits, underscores, and dollar signs, with an optional \
         single schema qualifier (e.g. \"schema.table\")"
    )]
    InvalidTableName(String),

    #[error("Invalid invalidation payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Configuration
    #[error("Invalid configuration value: {key} = {value}")]
    InvalidConfigValue { key: String, value: String },
}

impl TagIndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TagIndexError::Redis(e) => {
                if e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                {
                    ErrorKind::Transport
                } else {
                    ErrorKind::Backend
                }
            }
            TagIndexError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::CannotOpen
                        | rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ErrorKind::Transport
            }
            TagIndexError::Sqlite(_) | TagIndexError::Join(_) => ErrorKind::Backend,
            TagIndexError::PartialBatch { .. } => ErrorKind::PartialBatch,
            TagIndexError::InvalidTag(_)
            | TagIndexError::InvalidQueryId
            | TagIndexError::InvalidTableName(_)
            | TagIndexError::InvalidPayload(_)
            | TagIndexError::Serialization(_)
            | TagIndexError::InvalidConfigValue { .. } => ErrorKind::InvalidInput,
        }
    }
}
