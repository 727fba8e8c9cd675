// Collaborator traits
//
// These traits keep the pipeline storage-agnostic:
// - In-memory implementations for tests and database-less runs
// - PostgreSQL implementations for production
// - Channel-backed implementations for hub signalling

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::error::{EmitError, StoreResult};
use crate::notification::{
    ChannelPreferences, HubSignal, NotificationRecord, NotificationStatus, Operator,
};
use crate::occurrence::{Occurrence, OccurrenceFilter, OccurrenceHistory, OccurrenceStatus};
use crate::rules::RuleDefinition;

// ============================================================================
// OccurrenceStore
// ============================================================================

/// Persistence for occurrences
///
/// Only `OccurrenceLifecycle` calls `update_status`; everything else reads.
#[async_trait]
pub trait OccurrenceStore: Send + Sync {
    /// Insert a new occurrence. Fails with `DuplicateOccurrence` when one
    /// already exists for the same (hospital, event id).
    async fn create(&self, occurrence: &Occurrence) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Occurrence>>;

    async fn exists_for_event(&self, hospital_id: Uuid, event_id: &str) -> StoreResult<bool>;

    /// Compare-and-set status write. Fails with `StaleStatus` when the stored
    /// status is not `expected`.
    async fn update_status(
        &self,
        id: Uuid,
        expected: OccurrenceStatus,
        next: OccurrenceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Occurrence>;

    /// Stamp notified-at once the hub has dispatched a new occurrence
    async fn mark_notified(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    async fn list(&self, filter: &OccurrenceFilter) -> StoreResult<Vec<Occurrence>>;
}

// ============================================================================
// HistoryStore
// ============================================================================

/// Append-only lifecycle trail
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: &OccurrenceHistory) -> StoreResult<()>;

    /// Entries for an occurrence, oldest first
    async fn list(&self, occurrence_id: Uuid) -> StoreResult<Vec<OccurrenceHistory>>;

    /// The outcome entry for an occurrence, if one was registered
    async fn find_outcome(&self, occurrence_id: Uuid) -> StoreResult<Option<OccurrenceHistory>>;
}

// ============================================================================
// NotificationStore
// ============================================================================

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(&self, record: &NotificationRecord) -> StoreResult<()>;

    /// Move a pending record to sent or failed. Completed records are immutable.
    async fn complete(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<NotificationRecord>;

    async fn list_for_occurrence(&self, occurrence_id: Uuid) -> StoreResult<Vec<NotificationRecord>>;
}

// ============================================================================
// External lookups
// ============================================================================

/// Active triage rules per tenant
#[async_trait]
pub trait RuleProvider: Send + Sync {
    async fn active_rules(&self, tenant_id: Uuid) -> StoreResult<Vec<RuleDefinition>>;
}

/// Who is on duty for a hospital at a given time
#[async_trait]
pub trait ShiftDirectory: Send + Sync {
    async fn on_duty(&self, hospital_id: Uuid, at: DateTime<Utc>) -> StoreResult<Vec<Operator>>;

    /// Active managers linked to the hospital, reached when no shift covers an event
    async fn fallback_managers(&self, hospital_id: Uuid) -> StoreResult<Vec<Operator>>;
}

/// Per-user channel opt-in and push device tokens
#[async_trait]
pub trait PreferenceDirectory: Send + Sync {
    async fn preferences(&self, user_id: Uuid) -> StoreResult<ChannelPreferences>;

    async fn push_tokens(&self, user_id: Uuid) -> StoreResult<Vec<String>>;
}

// ============================================================================
// Sinks
// ============================================================================

/// Feeds signals into the notification hub
#[async_trait]
pub trait SignalEmitter: Send + Sync {
    async fn emit(&self, signal: HubSignal) -> Result<(), EmitError>;
}

/// Write-only audit trail
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}
