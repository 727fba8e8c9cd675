//! PostgreSQL outbox-table stream
//!
//! Producers insert rows into `death_events (id BIGSERIAL, fields JSONB,
//! status TEXT, attempts INT, claimed_at TIMESTAMPTZ, last_error TEXT,
//! created_at TIMESTAMPTZ)`. Readers claim pending rows with
//! `FOR UPDATE SKIP LOCKED`; rows claimed longer than the visibility timeout
//! become claimable again.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::{debug, error, instrument};

use super::{EventStream, StreamError, StreamMessage};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct PostgresEventStream {
    pool: PgPool,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

impl PostgresEventStream {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Fail fast at startup when the outbox table is unreachable
    pub async fn check(&self) -> Result<(), StreamError> {
        sqlx::query("SELECT 1 FROM death_events LIMIT 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim(&self, max: usize) -> Result<Vec<StreamMessage>, StreamError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM death_events
                WHERE status = 'pending'
                   OR (status = 'claimed' AND claimed_at < NOW() - make_interval(secs => $2))
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE death_events e
            SET status = 'claimed',
                claimed_at = NOW(),
                attempts = attempts + 1
            FROM claimable c
            WHERE e.id = c.id
            RETURNING e.id, e.fields
            "#,
        )
        .bind(max as i64)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim death events: {}", e);
            StreamError::from(e)
        })?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let fields: serde_json::Value = row.try_get("fields")?;
            messages.push(StreamMessage {
                id: id.to_string(),
                fields: flatten(fields),
            });
        }
        messages.sort_by_key(|m| m.id.parse::<i64>().unwrap_or_default());
        Ok(messages)
    }

    async fn set_status(&self, id: &str, status: &str, error: Option<&str>) -> Result<(), StreamError> {
        let id: i64 = id
            .parse()
            .map_err(|_| StreamError::Backend(format!("invalid message id: {id}")))?;
        sqlx::query("UPDATE death_events SET status = $2, last_error = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn flatten(fields: serde_json::Value) -> HashMap<String, String> {
    match fields {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some((key, s)),
                other => Some((key, other.to_string())),
            })
            .collect(),
        _ => HashMap::new(),
    }
}

#[async_trait]
impl EventStream for PostgresEventStream {
    #[instrument(skip(self))]
    async fn read(&self, max: usize, timeout: Duration) -> Result<Vec<StreamMessage>, StreamError> {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.claim(max).await?;
            if !batch.is_empty() {
                debug!(count = batch.len(), "Claimed death events");
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, id: &str) -> Result<(), StreamError> {
        self.set_status(id, "processed", None).await
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<(), StreamError> {
        self.set_status(id, "failed", Some(reason)).await
    }
}
