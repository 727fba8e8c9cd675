// Live notification stream (SSE)
//
// Each connection registers a hub session. The session handle lives inside
// the response stream, so when the client disconnects axum drops the stream
// and the session is unregistered.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::{self, Stream};
use vigil_pipeline::LiveEvent;

use crate::auth::AuthUser;
use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/notifications/stream", get(stream_sse))
        .with_state(state)
}

fn to_sse(event: &LiveEvent) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default()
        .event(&event.event_type)
        .id(event.id.to_string())
        .data(data)
}

/// GET /v1/notifications/stream - live occurrence events for the caller's scope
pub async fn stream_sse(
    State(state): State<AppState>,
    AuthUser(scope): AuthUser,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    tracing::info!(
        user_id = %scope.user_id,
        role = %scope.role,
        hospital_id = ?scope.hospital_id,
        "Opening live stream"
    );
    let session = state.hub.subscribe(scope);

    let events = stream::unfold(session, |session| async move {
        let event = session.recv().await?;
        Some((Ok(to_sse(&event)), session))
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
