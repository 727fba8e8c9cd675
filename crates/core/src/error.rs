// Error types for collaborator operations

use thiserror::Error;
use uuid::Uuid;

use crate::occurrence::OccurrenceStatus;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by persistence collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    /// Occurrence not found
    #[error("occurrence not found: {0}")]
    OccurrenceNotFound(Uuid),

    /// Notification record not found
    #[error("notification record not found: {0}")]
    NotificationNotFound(Uuid),

    /// An occurrence already exists for this source event
    #[error("occurrence already exists for event {event_id} at hospital {hospital_id}")]
    DuplicateOccurrence { hospital_id: Uuid, event_id: String },

    /// Compare-and-set on the status column failed
    #[error("occurrence {id} status changed concurrently: expected {expected}, found {actual}")]
    StaleStatus {
        id: Uuid,
        expected: OccurrenceStatus,
        actual: OccurrenceStatus,
    },

    /// Notification record is already sent or failed
    #[error("notification record {0} is already completed")]
    RecordCompleted(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Error returned when a hub signal cannot be delivered
#[derive(Debug, Error)]
pub enum EmitError {
    /// The receiving side has shut down
    #[error("signal channel closed")]
    Closed,
}
