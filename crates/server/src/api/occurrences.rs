// Occurrence handling routes
//
// Thin layer over OccurrenceLifecycle: every status write goes through it so
// history, audit and hub signals stay consistent.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_core::{
    Occurrence, OccurrenceHistory, OccurrenceStatus, OutcomeType, PatientRecord, TransitionRequest,
    Urgency,
};

use super::common::{ApiError, ErrorResponse};
use crate::auth::AuthUser;
use crate::state::AppState;

/// Detail view. Includes the full patient payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccurrenceDetail {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_id: String,
    pub hospital_id: Uuid,
    pub status: OccurrenceStatus,
    pub allowed_transitions: Vec<OccurrenceStatus>,
    pub priority_score: u8,
    pub masked_patient_name: String,
    pub patient: PatientRecord,
    pub death_at: DateTime<Utc>,
    pub window_expires_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    pub urgency: Urgency,
    pub time_remaining: String,
    pub time_remaining_minutes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OccurrenceDetail {
    pub fn build(occurrence: Occurrence, now: DateTime<Utc>) -> Self {
        Self {
            urgency: occurrence.urgency(now),
            time_remaining: occurrence.format_time_remaining(now),
            time_remaining_minutes: occurrence.time_remaining(now).num_minutes(),
            allowed_transitions: occurrence.status.allowed_targets().to_vec(),
            id: occurrence.id,
            tenant_id: occurrence.tenant_id,
            event_id: occurrence.event_id,
            hospital_id: occurrence.hospital_id,
            status: occurrence.status,
            priority_score: occurrence.priority_score,
            masked_patient_name: occurrence.masked_patient_name,
            patient: occurrence.patient,
            death_at: occurrence.death_at,
            window_expires_at: occurrence.window_expires_at,
            notified_at: occurrence.notified_at,
            created_at: occurrence.created_at,
            updated_at: occurrence.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeRequest {
    pub outcome: OutcomeType,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub data: Vec<OccurrenceHistory>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/occurrences/:id", get(get_occurrence))
        .route("/v1/occurrences/:id/history", get(get_history))
        .route("/v1/occurrences/:id/status", post(update_status))
        .route("/v1/occurrences/:id/outcome", post(register_outcome))
        .with_state(state)
}

/// Load an occurrence the caller is allowed to see. Out-of-scope ids read as missing.
async fn load_scoped(state: &AppState, user: &AuthUser, id: Uuid) -> Result<Occurrence, ApiError> {
    let occurrence = state
        .occurrences
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("occurrence not found: {id}")))?;
    if !user.can_access(occurrence.tenant_id, occurrence.hospital_id) {
        return Err(ApiError::not_found(format!("occurrence not found: {id}")));
    }
    Ok(occurrence)
}

/// GET /v1/occurrences/{id}
pub async fn get_occurrence(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<OccurrenceDetail>, ApiError> {
    let occurrence = load_scoped(&state, &user, id).await?;
    Ok(Json(OccurrenceDetail::build(occurrence, Utc::now())))
}

/// GET /v1/occurrences/{id}/history
pub async fn get_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<HistoryResponse>, ApiError> {
    load_scoped(&state, &user, id).await?;
    let data = state.history.list(id).await?;
    Ok(Json(HistoryResponse { data }))
}

/// POST /v1/occurrences/{id}/status
pub async fn update_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<OccurrenceDetail>, ApiError> {
    let target: OccurrenceStatus = request.status.parse().map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new(format!("unknown status: {}", request.status))
                .with_allowed(OccurrenceStatus::ALL.to_vec()),
        )
    })?;
    load_scoped(&state, &user, id).await?;

    let mut transition = TransitionRequest::new(id, target).with_actor(user.0.user_id);
    if let Some(notes) = request.notes {
        transition = transition.with_notes(notes);
    }
    let updated = state.lifecycle.transition(transition).await?;
    Ok(Json(OccurrenceDetail::build(updated, Utc::now())))
}

/// POST /v1/occurrences/{id}/outcome
pub async fn register_outcome(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<OutcomeRequest>,
) -> Result<(StatusCode, Json<OccurrenceHistory>), ApiError> {
    load_scoped(&state, &user, id).await?;
    let entry = state
        .lifecycle
        .register_outcome(id, request.outcome, Some(user.0.user_id), request.notes)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
