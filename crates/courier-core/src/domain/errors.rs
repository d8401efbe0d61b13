//! Error types.
//!
//! - `StoreError`: failures of the task envelope store.
//! - `CourierError`: what producers, admins and the orchestrator see.

use thiserror::Error;

use super::ids::TaskId;
use super::task::TaskState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Idempotency key collision. Carries the id of the existing row.
    #[error("duplicate submission, existing task {0}")]
    DuplicateSubmission(TaskId),

    /// The caller's lease token no longer matches (expired or reclaimed).
    #[error("lease expired for task {0}")]
    LeaseExpired(TaskId),

    #[error("task {task_id} cannot go from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    /// Backend unreachable. The broker retries these.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored row that does not decode into a task.
    #[error("corrupt task row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Connectivity-type failures that may go away on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::Database(err) => is_transient_db_error(err),
            _ => false,
        }
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    }
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no handler registered for kind '{0}'")]
    UnknownKind(String),

    #[error("lease expired for task {0}")]
    LeaseExpired(TaskId),

    #[error("rate capacity exceeded")]
    CapacityExceeded,

    /// Store failures persisted beyond the retry budget. Fatal to the process.
    #[error("store unavailable after {attempts} attempts: {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<StoreError> for CourierError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeaseExpired(id) => CourierError::LeaseExpired(id),
            other => CourierError::Store(other),
        }
    }
}

impl From<config::ConfigError> for CourierError {
    fn from(err: config::ConfigError) -> Self {
        CourierError::Config(err.to_string())
    }
}

impl CourierError {
    /// Errors that must halt the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}
