//! PostgreSQL collaborators
//!
//! One pooled store implements every persistence trait. Queries are runtime
//! `sqlx::query` calls; the expected tables are:
//!
//! - `occurrences` with a unique `(hospital_id, event_id)` constraint
//! - `occurrence_history` (append-only)
//! - `notifications`
//! - `triage_rules`
//! - `shifts` joined with `users`
//! - `user_hospitals` joined with `users` (manager fallback)
//! - `notification_preferences` and `push_subscriptions`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::notification::{
    ChannelPreferences, NotificationChannel, NotificationRecord, NotificationStatus, Operator,
};
use crate::occurrence::{
    HistoryAction, Occurrence, OccurrenceFilter, OccurrenceHistory, OccurrenceStatus,
    OutcomeType, PatientRecord,
};
use crate::rules::RuleDefinition;
use crate::traits::{
    HistoryStore, NotificationStore, OccurrenceStore, PreferenceDirectory, RuleProvider,
    ShiftDirectory,
};

const OCCURRENCE_COLUMNS: &str = "id, tenant_id, event_id, hospital_id, status, priority_score, \
     masked_patient_name, patient, death_at, window_expires_at, notified_at, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connectivity check for health reporting
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn decode_err(column: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(format!("{column}: {e}"))
}

fn occurrence_from_row(row: &PgRow) -> StoreResult<Occurrence> {
    let status: String = row.try_get("status")?;
    let score: i16 = row.try_get("priority_score")?;
    let patient: serde_json::Value = row.try_get("patient")?;
    let patient: PatientRecord = serde_json::from_value(patient)?;

    Ok(Occurrence {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        event_id: row.try_get("event_id")?,
        hospital_id: row.try_get("hospital_id")?,
        status: status
            .parse::<OccurrenceStatus>()
            .map_err(|e| decode_err("status", e))?,
        priority_score: score.clamp(0, 100) as u8,
        masked_patient_name: row.try_get("masked_patient_name")?,
        patient,
        death_at: row.try_get("death_at")?,
        window_expires_at: row.try_get("window_expires_at")?,
        notified_at: row.try_get("notified_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn history_from_row(row: &PgRow) -> StoreResult<OccurrenceHistory> {
    let action: String = row.try_get("action")?;
    let previous: Option<String> = row.try_get("previous_status")?;
    let next: Option<String> = row.try_get("next_status")?;
    let outcome: Option<String> = row.try_get("outcome")?;

    Ok(OccurrenceHistory {
        id: row.try_get("id")?,
        occurrence_id: row.try_get("occurrence_id")?,
        actor: row.try_get("actor")?,
        action: action
            .parse::<HistoryAction>()
            .map_err(|e| decode_err("action", e))?,
        previous_status: previous
            .map(|s| s.parse::<OccurrenceStatus>())
            .transpose()
            .map_err(|e| decode_err("previous_status", e))?,
        next_status: next
            .map(|s| s.parse::<OccurrenceStatus>())
            .transpose()
            .map_err(|e| decode_err("next_status", e))?,
        outcome: outcome
            .map(|s| s.parse::<OutcomeType>())
            .transpose()
            .map_err(|e| decode_err("outcome", e))?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> StoreResult<NotificationRecord> {
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    Ok(NotificationRecord {
        id: row.try_get("id")?,
        occurrence_id: row.try_get("occurrence_id")?,
        user_id: row.try_get("user_id")?,
        channel: channel
            .parse::<NotificationChannel>()
            .map_err(|e| decode_err("channel", e))?,
        status: status
            .parse::<NotificationStatus>()
            .map_err(|e| decode_err("status", e))?,
        target: row.try_get("target")?,
        error: row.try_get("error")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl OccurrenceStore for PostgresStore {
    #[instrument(skip(self, occurrence), fields(occurrence_id = %occurrence.id))]
    async fn create(&self, occurrence: &Occurrence) -> StoreResult<()> {
        let patient = serde_json::to_value(&occurrence.patient)?;
        let result = sqlx::query(
            r#"
            INSERT INTO occurrences (
                id, tenant_id, event_id, hospital_id, status, priority_score,
                masked_patient_name, patient, death_at, window_expires_at,
                notified_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (hospital_id, event_id) DO NOTHING
            "#,
        )
        .bind(occurrence.id)
        .bind(occurrence.tenant_id)
        .bind(&occurrence.event_id)
        .bind(occurrence.hospital_id)
        .bind(occurrence.status.as_str())
        .bind(i16::from(occurrence.priority_score))
        .bind(&occurrence.masked_patient_name)
        .bind(patient)
        .bind(occurrence.death_at)
        .bind(occurrence.window_expires_at)
        .bind(occurrence.notified_at)
        .bind(occurrence.created_at)
        .bind(occurrence.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert occurrence: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateOccurrence {
                hospital_id: occurrence.hospital_id,
                event_id: occurrence.event_id.clone(),
            });
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Occurrence>> {
        let row = sqlx::query(&format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM occurrences WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(occurrence_from_row).transpose()
    }

    async fn exists_for_event(&self, hospital_id: Uuid, event_id: &str) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM occurrences WHERE hospital_id = $1 AND event_id = $2)",
        )
        .bind(hospital_id)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        id: Uuid,
        expected: OccurrenceStatus,
        next: OccurrenceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Occurrence> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE occurrences
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING {OCCURRENCE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => occurrence_from_row(&row),
            None => match self.get(id).await? {
                Some(current) => Err(StoreError::StaleStatus {
                    id,
                    expected,
                    actual: current.status,
                }),
                None => Err(StoreError::OccurrenceNotFound(id)),
            },
        }
    }

    async fn mark_notified(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE occurrences SET notified_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::OccurrenceNotFound(id));
        }
        Ok(())
    }

    async fn list(&self, filter: &OccurrenceFilter) -> StoreResult<Vec<Occurrence>> {
        let statuses: Option<Vec<String>> = filter
            .statuses
            .as_ref()
            .map(|s| s.iter().map(|s| s.as_str().to_string()).collect());
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {OCCURRENCE_COLUMNS}
            FROM occurrences
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::uuid IS NULL OR hospital_id = $2)
              AND ($3::text[] IS NULL OR status = ANY($3))
              AND (NOT $4 OR status NOT IN ('CONCLUDED', 'CANCELED'))
            ORDER BY priority_score DESC, created_at ASC
            LIMIT $5
            "#
        ))
        .bind(filter.tenant_id)
        .bind(filter.hospital_id)
        .bind(statuses)
        .bind(filter.active_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(occurrence_from_row).collect()
    }
}

#[async_trait]
impl HistoryStore for PostgresStore {
    async fn append(&self, entry: &OccurrenceHistory) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO occurrence_history (
                id, occurrence_id, actor, action, previous_status, next_status,
                outcome, notes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.occurrence_id)
        .bind(entry.actor)
        .bind(entry.action.as_str())
        .bind(entry.previous_status.map(|s| s.as_str()))
        .bind(entry.next_status.map(|s| s.as_str()))
        .bind(entry.outcome.map(|o| o.as_str()))
        .bind(&entry.notes)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, occurrence_id: Uuid) -> StoreResult<Vec<OccurrenceHistory>> {
        let rows = sqlx::query(
            r#"
            SELECT id, occurrence_id, actor, action, previous_status, next_status,
                   outcome, notes, created_at
            FROM occurrence_history
            WHERE occurrence_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(occurrence_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn find_outcome(&self, occurrence_id: Uuid) -> StoreResult<Option<OccurrenceHistory>> {
        let row = sqlx::query(
            r#"
            SELECT id, occurrence_id, actor, action, previous_status, next_status,
                   outcome, notes, created_at
            FROM occurrence_history
            WHERE occurrence_id = $1 AND outcome IS NOT NULL
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(occurrence_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(history_from_row).transpose()
    }
}

#[async_trait]
impl NotificationStore for PostgresStore {
    async fn create(&self, record: &NotificationRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, occurrence_id, user_id, channel, status, target, error,
                metadata, created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.occurrence_id)
        .bind(record.user_id)
        .bind(record.channel.as_str())
        .bind(record.status.as_str())
        .bind(&record.target)
        .bind(&record.error)
        .bind(&record.metadata)
        .bind(record.created_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<NotificationRecord> {
        let row = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2, error = $3, completed_at = $4
            WHERE id = $1 AND status = 'pending'
            RETURNING id, occurrence_id, user_id, channel, status, target, error,
                      metadata, created_at, completed_at
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => notification_from_row(&row),
            None => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM notifications WHERE id = $1)")
                        .bind(id)
                        .fetch_one(&self.pool)
                        .await?;
                if exists {
                    Err(StoreError::RecordCompleted(id))
                } else {
                    Err(StoreError::NotificationNotFound(id))
                }
            }
        }
    }

    async fn list_for_occurrence(&self, occurrence_id: Uuid) -> StoreResult<Vec<NotificationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, occurrence_id, user_id, channel, status, target, error,
                   metadata, created_at, completed_at
            FROM notifications
            WHERE occurrence_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(occurrence_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }
}

#[async_trait]
impl RuleProvider for PostgresStore {
    #[instrument(skip(self))]
    async fn active_rules(&self, tenant_id: Uuid) -> StoreResult<Vec<RuleDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, priority, active, config
            FROM triage_rules
            WHERE tenant_id = $1 AND active = TRUE
            ORDER BY priority ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<RuleDefinition> {
                Ok(RuleDefinition {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    priority: row.try_get("priority")?,
                    active: row.try_get("active")?,
                    config: row.try_get("config")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ShiftDirectory for PostgresStore {
    async fn on_duty(&self, hospital_id: Uuid, at: DateTime<Utc>) -> StoreResult<Vec<Operator>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT u.id, u.name, u.email, u.phone
            FROM shifts s
            JOIN users u ON u.id = s.user_id
            WHERE s.hospital_id = $1
              AND s.starts_at <= $2
              AND s.ends_at > $2
              AND u.active = TRUE
            "#,
        )
        .bind(hospital_id)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<Operator> {
                Ok(Operator {
                    user_id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    email: row.try_get("email")?,
                    phone: row.try_get("phone")?,
                })
            })
            .collect()
    }

    async fn fallback_managers(&self, hospital_id: Uuid) -> StoreResult<Vec<Operator>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.name, u.email, u.phone
            FROM users u
            JOIN user_hospitals uh ON uh.user_id = u.id
            WHERE uh.hospital_id = $1
              AND u.role = 'manager'
              AND u.active = TRUE
            ORDER BY u.name ASC
            "#,
        )
        .bind(hospital_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<Operator> {
                Ok(Operator {
                    user_id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    email: row.try_get("email")?,
                    phone: row.try_get("phone")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PreferenceDirectory for PostgresStore {
    async fn preferences(&self, user_id: Uuid) -> StoreResult<ChannelPreferences> {
        let row = sqlx::query(
            r#"
            SELECT dashboard_enabled, email_enabled, sms_enabled, push_enabled
            FROM notification_preferences
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(ChannelPreferences {
                dashboard: row.try_get("dashboard_enabled")?,
                email: row.try_get("email_enabled")?,
                sms: row.try_get("sms_enabled")?,
                push: row.try_get("push_enabled")?,
            }),
            None => Ok(ChannelPreferences::default()),
        }
    }

    async fn push_tokens(&self, user_id: Uuid) -> StoreResult<Vec<String>> {
        let tokens: Vec<String> = sqlx::query_scalar(
            "SELECT token FROM push_subscriptions WHERE user_id = $1 AND active = TRUE",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }
}
