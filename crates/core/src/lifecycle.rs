//! Occurrence lifecycle state machine
//!
//! `OccurrenceLifecycle` is the only writer of occurrence status. Writes for a
//! single occurrence are serialized through a striped async lock, and hub
//! signals are emitted while the lock is held, so sessions observe one
//! occurrence's transitions in the order they happened.
//!
//! ```text
//! PENDING -> IN_PROGRESS -> ACCEPTED | REFUSED -> CONCLUDED
//! PENDING | IN_PROGRESS | ACCEPTED | REFUSED -> CANCELED
//! ```

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::error::StoreError;
use crate::notification::HubSignal;
use crate::occurrence::{Occurrence, OccurrenceHistory, OccurrenceStatus, OutcomeType};
use crate::traits::{AuditSink, HistoryStore, OccurrenceStore, SignalEmitter};

const LOCK_STRIPES: usize = 64;

/// Domain-rule violations returned to the calling layer
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("occurrence not found: {0}")]
    NotFound(Uuid),

    #[error("invalid transition from {from} to {to} (allowed: {})", join_statuses(.allowed))]
    InvalidTransition {
        from: OccurrenceStatus,
        to: OccurrenceStatus,
        allowed: Vec<OccurrenceStatus>,
    },

    #[error("occurrence {0} cannot be concluded before an outcome is registered")]
    OutcomeRequired(Uuid),

    #[error("occurrence {0} already has a registered outcome")]
    OutcomeAlreadyRegistered(Uuid),

    #[error("outcome cannot be registered while occurrence {id} is {status}")]
    OutcomeNotAllowed { id: Uuid, status: OccurrenceStatus },

    #[error("occurrence {0} was modified concurrently")]
    Conflict(Uuid),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::OccurrenceNotFound(id) => LifecycleError::NotFound(id),
            StoreError::StaleStatus { id, .. } => LifecycleError::Conflict(id),
            other => LifecycleError::Store(other),
        }
    }
}

fn join_statuses(statuses: &[OccurrenceStatus]) -> String {
    if statuses.is_empty() {
        return "none".to_string();
    }
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A requested status change
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub occurrence_id: Uuid,
    pub target: OccurrenceStatus,
    pub actor: Option<Uuid>,
    pub notes: Option<String>,
}

impl TransitionRequest {
    pub fn new(occurrence_id: Uuid, target: OccurrenceStatus) -> Self {
        Self {
            occurrence_id,
            target,
            actor: None,
            notes: None,
        }
    }

    pub fn with_actor(mut self, actor: Uuid) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

pub struct OccurrenceLifecycle {
    occurrences: Arc<dyn OccurrenceStore>,
    history: Arc<dyn HistoryStore>,
    emitter: Arc<dyn SignalEmitter>,
    audit: Arc<dyn AuditSink>,
    locks: Vec<Mutex<()>>,
}

impl OccurrenceLifecycle {
    pub fn new(
        occurrences: Arc<dyn OccurrenceStore>,
        history: Arc<dyn HistoryStore>,
        emitter: Arc<dyn SignalEmitter>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            occurrences,
            history,
            emitter,
            audit,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock_for(&self, id: Uuid) -> &Mutex<()> {
        &self.locks[(id.as_u128() % LOCK_STRIPES as u128) as usize]
    }

    /// Persist a freshly triaged occurrence, append its "created" history row
    /// and signal the hub.
    #[instrument(skip(self, occurrence), fields(occurrence_id = %occurrence.id, hospital_id = %occurrence.hospital_id))]
    pub async fn open(&self, occurrence: Occurrence) -> Result<Occurrence, StoreError> {
        let _guard = self.lock_for(occurrence.id).lock().await;

        self.occurrences.create(&occurrence).await?;

        if let Err(e) = self.history.append(&OccurrenceHistory::created(&occurrence)).await {
            warn!(error = %e, "Failed to append creation history");
        }

        self.audit
            .record(AuditEntry {
                tenant_id: occurrence.tenant_id,
                actor: None,
                action: "occurrence.created".to_string(),
                entity_type: "occurrence".to_string(),
                entity_id: occurrence.id,
                details: serde_json::json!({
                    "event_id": occurrence.event_id,
                    "priority_score": occurrence.priority_score,
                    "patient": occurrence.masked_patient_name,
                }),
                at: occurrence.created_at,
            })
            .await;

        self.signal(HubSignal::OccurrenceCreated {
            occurrence: occurrence.clone(),
        })
        .await;

        Ok(occurrence)
    }

    /// Apply a status transition along the legal table
    #[instrument(skip(self, request), fields(occurrence_id = %request.occurrence_id, target = %request.target))]
    pub async fn transition(&self, request: TransitionRequest) -> Result<Occurrence, LifecycleError> {
        let id = request.occurrence_id;
        let _guard = self.lock_for(id).lock().await;

        let current = self
            .occurrences
            .get(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))?;
        let from = current.status;

        if !from.can_transition_to(request.target) {
            return Err(LifecycleError::InvalidTransition {
                from,
                to: request.target,
                allowed: from.allowed_targets().to_vec(),
            });
        }

        if request.target == OccurrenceStatus::Concluded
            && self.history.find_outcome(id).await?.is_none()
        {
            return Err(LifecycleError::OutcomeRequired(id));
        }

        let now = Utc::now();
        let updated = self
            .occurrences
            .update_status(id, from, request.target, now)
            .await?;

        let entry = OccurrenceHistory::transition(
            id,
            request.actor,
            from,
            request.target,
            request.notes.clone(),
            now,
        );
        if let Err(e) = self.history.append(&entry).await {
            warn!(error = %e, "Failed to append transition history");
        }

        self.audit
            .record(AuditEntry {
                tenant_id: updated.tenant_id,
                actor: request.actor,
                action: format!("occurrence.{}", entry.action.as_str()),
                entity_type: "occurrence".to_string(),
                entity_id: id,
                details: serde_json::json!({
                    "previous_status": from,
                    "next_status": request.target,
                    "notes": request.notes,
                }),
                at: now,
            })
            .await;

        info!(from = %from, to = %request.target, "Occurrence transitioned");

        self.signal(HubSignal::StatusChanged {
            occurrence: updated.clone(),
            previous: from,
            actor: request.actor,
        })
        .await;

        Ok(updated)
    }

    /// Record the final outcome. Legal once, while ACCEPTED or REFUSED.
    #[instrument(skip(self, notes), fields(occurrence_id = %occurrence_id, outcome = %outcome))]
    pub async fn register_outcome(
        &self,
        occurrence_id: Uuid,
        outcome: OutcomeType,
        actor: Option<Uuid>,
        notes: Option<String>,
    ) -> Result<OccurrenceHistory, LifecycleError> {
        let _guard = self.lock_for(occurrence_id).lock().await;

        let current = self
            .occurrences
            .get(occurrence_id)
            .await?
            .ok_or(LifecycleError::NotFound(occurrence_id))?;

        if !current.status.accepts_outcome() {
            return Err(LifecycleError::OutcomeNotAllowed {
                id: occurrence_id,
                status: current.status,
            });
        }

        if self.history.find_outcome(occurrence_id).await?.is_some() {
            return Err(LifecycleError::OutcomeAlreadyRegistered(occurrence_id));
        }

        let now = Utc::now();
        let entry = OccurrenceHistory::outcome(
            occurrence_id,
            actor,
            current.status,
            outcome,
            notes,
            now,
        );
        // The outcome row is the authoritative fact here, so failures propagate
        self.history.append(&entry).await?;

        self.audit
            .record(AuditEntry {
                tenant_id: current.tenant_id,
                actor,
                action: "occurrence.outcome_registered".to_string(),
                entity_type: "occurrence".to_string(),
                entity_id: occurrence_id,
                details: serde_json::json!({ "outcome": outcome, "notes": entry.notes }),
                at: now,
            })
            .await;

        info!("Outcome registered");

        self.signal(HubSignal::OutcomeRegistered {
            occurrence: current,
            outcome,
            actor,
        })
        .await;

        Ok(entry)
    }

    async fn signal(&self, signal: HubSignal) {
        let event_type = signal.event_type();
        if let Err(e) = self.emitter.emit(signal).await {
            warn!(event_type, error = %e, "Failed to signal notification hub");
        }
    }
}
