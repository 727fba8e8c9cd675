// Hospital urgency summary

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_core::{OccurrenceFilter, OccurrenceStatus, Urgency};

use super::common::ApiError;
use crate::auth::AuthUser;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccurrenceUrgency {
    pub id: Uuid,
    pub status: OccurrenceStatus,
    pub priority_score: u8,
    pub urgency: Urgency,
    pub time_remaining: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrgencySummary {
    pub hospital_id: Uuid,
    /// Most severe tier across active occurrences, NONE when there are none
    pub urgency: Urgency,
    pub active: usize,
    pub occurrences: Vec<OccurrenceUrgency>,
    pub computed_at: DateTime<Utc>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/hospitals/:id/urgency", get(get_urgency))
        .with_state(state)
}

/// GET /v1/hospitals/{id}/urgency
pub async fn get_urgency(
    State(state): State<AppState>,
    user: AuthUser,
    Path(hospital_id): Path<Uuid>,
) -> Result<Json<UrgencySummary>, ApiError> {
    if !user.can_access(user.0.tenant_id, hospital_id) {
        return Err(ApiError::not_found(format!("hospital not found: {hospital_id}")));
    }

    let filter = OccurrenceFilter {
        tenant_id: Some(user.0.tenant_id),
        ..OccurrenceFilter::for_hospital(hospital_id).active()
    };
    let active = state.occurrences.list(&filter).await?;

    let now = Utc::now();
    let occurrences: Vec<OccurrenceUrgency> = active
        .iter()
        .map(|o| OccurrenceUrgency {
            id: o.id,
            status: o.status,
            priority_score: o.priority_score,
            urgency: o.urgency(now),
            time_remaining: o.format_time_remaining(now),
        })
        .collect();

    Ok(Json(UrgencySummary {
        hospital_id,
        urgency: Urgency::aggregate(occurrences.iter().map(|o| o.urgency)),
        active: occurrences.len(),
        occurrences,
        computed_at: now,
    }))
}
