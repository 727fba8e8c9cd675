// HTTP API routes

pub mod common;
pub mod health;
pub mod hospitals;
pub mod occurrences;
pub mod stream;

use axum::Router;

pub use common::{ApiError, ErrorResponse};

use crate::state::AppState;

/// Versioned routes (prefixable); /health is mounted separately
pub fn routes(state: AppState) -> Router {
    Router::new()
        .merge(stream::routes(state.clone()))
        .merge(occurrences::routes(state.clone()))
        .merge(hospitals::routes(state))
}
