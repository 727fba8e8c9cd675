//! Inbound event stream
//!
//! The ingestor reads flat key-value messages from an [`EventStream`]. Delivery
//! is at-least-once: a message stays claimable until it is acknowledged or
//! failed, so the ingestor deduplicates on the event id.

mod memory;
mod postgres;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryEventStream;
pub use postgres::PostgresEventStream;

/// One stream entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Backend-assigned message id used for ack/fail
    pub id: String,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream unavailable: {0}")]
    Unavailable(String),

    #[error("stream backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StreamError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StreamError::Unavailable(e.to_string())
            }
            other => StreamError::Backend(other.to_string()),
        }
    }
}

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Wait up to `timeout` for at most `max` messages. An empty result means
    /// the timeout elapsed.
    async fn read(&self, max: usize, timeout: Duration) -> Result<Vec<StreamMessage>, StreamError>;

    /// Mark a message processed
    async fn ack(&self, id: &str) -> Result<(), StreamError>;

    /// Mark a message failed so it is kept for inspection instead of dropped
    async fn fail(&self, id: &str, reason: &str) -> Result<(), StreamError>;
}
