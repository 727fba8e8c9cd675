// Health surface
// Decision: Report 503 when any background component is not running so load balancers drain the node

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use vigil_core::TriageStats;
use vigil_pipeline::{HubStats, IngestorStatus};

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub ingestor: IngestorStatus,
    pub triage: TriageStats,
    pub hub: HubStats,
    pub timestamp: DateTime<Utc>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let ingestor = state.ingestor.status();
    let triage = state.engine.stats();
    let hub = state.hub.stats();
    let healthy = ingestor.running && triage.running && hub.running;

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        ingestor,
        triage,
        hub,
        timestamp: Utc::now(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
