// Shared application state

use std::sync::Arc;

use axum::extract::FromRef;
use vigil_core::{HistoryStore, OccurrenceLifecycle, OccurrenceStore, TriageEngine};
use vigil_pipeline::{EventIngestor, NotificationHub};

use crate::auth::JwtVerifier;

#[derive(Clone)]
pub struct AppState {
    pub occurrences: Arc<dyn OccurrenceStore>,
    pub history: Arc<dyn HistoryStore>,
    pub lifecycle: Arc<OccurrenceLifecycle>,
    pub ingestor: Arc<EventIngestor>,
    pub engine: Arc<TriageEngine>,
    pub hub: Arc<NotificationHub>,
    pub verifier: Arc<JwtVerifier>,
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}
