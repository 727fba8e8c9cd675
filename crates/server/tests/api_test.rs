// HTTP surface tests
//
// Full router over in-memory collaborators, driven with tower's oneshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;
use vigil_core::{
    InMemoryHistoryStore, InMemoryNotificationStore, InMemoryOccurrenceStore,
    InMemoryPreferenceDirectory, InMemoryShiftDirectory, Occurrence, OccurrenceLifecycle,
    OccurrenceStatus, PatientRecord, StaticRuleProvider, TracingAuditSink, TransitionRequest,
    TriageEngine,
};
use vigil_pipeline::{
    Dispatcher, EventIngestor, HubConfig, InMemoryEventStream, NotificationHub, PipelineConfig,
    RuleSetCache, SessionRole, SessionScope,
};
use vigil_server::{build_app, AppState, JwtVerifier, ServerConfig};

const SECRET: &str = "api-test-secret";

struct TestApp {
    tenant: Uuid,
    hospital: Uuid,
    state: AppState,
    router: Router,
}

fn test_config() -> ServerConfig {
    ServerConfig {
        http_addr: "127.0.0.1:0".to_string(),
        database_url: None,
        db_max_connections: 1,
        jwt_secret: SECRET.to_string(),
        environment: "test".to_string(),
        cors_origins: Vec::new(),
        api_prefix: String::new(),
    }
}

impl TestApp {
    fn new() -> Self {
        let occurrences = Arc::new(InMemoryOccurrenceStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let dispatcher = Dispatcher::new(
            Arc::new(InMemoryShiftDirectory::new()),
            Arc::new(InMemoryPreferenceDirectory::new()),
            Arc::new(InMemoryNotificationStore::new()),
            occurrences.clone(),
            HashMap::new(),
        );
        let (hub, handle) = NotificationHub::new(&HubConfig::default(), dispatcher);
        let lifecycle = Arc::new(OccurrenceLifecycle::new(
            occurrences.clone(),
            history.clone(),
            Arc::new(handle),
            Arc::new(TracingAuditSink),
        ));
        let engine = Arc::new(TriageEngine::new());
        let config = PipelineConfig::default();
        let ingestor = Arc::new(EventIngestor::new(
            Arc::new(InMemoryEventStream::new()),
            occurrences.clone(),
            lifecycle.clone(),
            Arc::new(RuleSetCache::new(
                Arc::new(StaticRuleProvider::new()),
                config.rules_cache_ttl,
            )),
            engine.clone(),
            config,
        ));

        let state = AppState {
            occurrences,
            history,
            lifecycle,
            ingestor,
            engine,
            hub,
            verifier: Arc::new(JwtVerifier::new(SECRET)),
        };
        let router = build_app(state.clone(), &test_config());
        Self {
            tenant: Uuid::now_v7(),
            hospital: Uuid::now_v7(),
            state,
            router,
        }
    }

    fn token(&self, role: SessionRole, hospital_id: Option<Uuid>) -> String {
        let scope = SessionScope {
            user_id: Uuid::now_v7(),
            role,
            tenant_id: self.tenant,
            hospital_id,
        };
        self.state
            .verifier
            .issue(&scope, chrono::Duration::hours(1))
            .unwrap()
    }

    fn operator_token(&self) -> String {
        self.token(SessionRole::Operator, Some(self.hospital))
    }

    async fn open(&self, hospital_id: Uuid) -> Occurrence {
        let now = Utc::now();
        let patient = PatientRecord {
            name: "Maria Souza".to_string(),
            birth_date: None,
            age: Some(54),
            cause_of_death: "cardiac arrest".to_string(),
            sector: Some("UTI".to_string()),
            bed: Some("12".to_string()),
            medical_record: Some("MR-1".to_string()),
            hospital_name: None,
            unknown_identity: false,
            detected_at: now,
        };
        let occurrence = Occurrence::new(
            self.tenant,
            format!("evt-{}", Uuid::now_v7()),
            hospital_id,
            90,
            patient,
            now - chrono::Duration::minutes(30),
            6,
            now,
        );
        self.state.lifecycle.open(occurrence).await.unwrap()
    }

    async fn move_to(&self, id: Uuid, targets: &[OccurrenceStatus]) {
        for target in targets {
            self.state
                .lifecycle
                .transition(TransitionRequest::new(id, *target))
                .await
                .unwrap();
        }
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }
}

#[tokio::test]
async fn test_health_degraded_until_components_run() {
    let app = TestApp::new();
    let (status, body) = app.get("/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["hub"]["running"], false);

    let cancel = CancellationToken::new();
    let hub = tokio::spawn(app.state.hub.clone().run(cancel.clone()));
    let ingestor = {
        let ingestor = app.state.ingestor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ingestor.run(cancel).await })
    };

    let mut healthy = false;
    for _ in 0..50 {
        let (status, body) = app.get("/health", None).await;
        if status == StatusCode::OK {
            assert_eq!(body["status"], "healthy");
            healthy = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(healthy);

    cancel.cancel();
    hub.await.unwrap().unwrap();
    ingestor.await.unwrap();
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = TestApp::new();
    let occurrence = app.open(app.hospital).await;

    let (status, body) = app
        .get(&format!("/v1/occurrences/{}", occurrence.id), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = app
        .get(&format!("/v1/occurrences/{}", occurrence.id), Some("not-a-jwt"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_occurrence_detail_includes_urgency_and_transitions() {
    let app = TestApp::new();
    let occurrence = app.open(app.hospital).await;
    let token = app.operator_token();

    let (status, body) = app
        .get(&format!("/v1/occurrences/{}", occurrence.id), Some(&token))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["masked_patient_name"], "Ma*** So***");
    assert_eq!(body["patient"]["name"], "Maria Souza");
    assert_eq!(body["allowed_transitions"], json!(["IN_PROGRESS", "CANCELED"]));
    // 5h30 left of a 6h window
    assert_eq!(body["urgency"], "GREEN");
    assert!(body["time_remaining_minutes"].as_i64().unwrap() > 300);
}

#[tokio::test]
async fn test_out_of_scope_occurrence_reads_as_missing() {
    let app = TestApp::new();
    let elsewhere = app.open(Uuid::now_v7()).await;
    let token = app.operator_token();

    let (status, _) = app
        .get(&format!("/v1/occurrences/{}", elsewhere.id), Some(&token))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Managers see the whole tenant
    let manager = app.token(SessionRole::Manager, None);
    let (status, _) = app
        .get(&format!("/v1/occurrences/{}", elsewhere.id), Some(&manager))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .get(&format!("/v1/occurrences/{}", Uuid::now_v7()), Some(&manager))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_update_walks_the_machine() {
    let app = TestApp::new();
    let occurrence = app.open(app.hospital).await;
    let token = app.operator_token();
    let uri = format!("/v1/occurrences/{}/status", occurrence.id);

    let (status, body) = app
        .post(&uri, &token, json!({"status": "IN_PROGRESS", "notes": "on my way"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "IN_PROGRESS");
    assert_eq!(
        body["allowed_transitions"],
        json!(["ACCEPTED", "REFUSED", "CANCELED"])
    );

    let (status, body) = app.get(&format!("/v1/occurrences/{}/history", occurrence.id), Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["data"].as_array().unwrap();
    assert!(entries
        .iter()
        .any(|e| e["next_status"] == "IN_PROGRESS" && e["notes"] == "on my way"));
}

#[tokio::test]
async fn test_illegal_transition_lists_allowed_targets() {
    let app = TestApp::new();
    let occurrence = app.open(app.hospital).await;
    let token = app.operator_token();
    let uri = format!("/v1/occurrences/{}/status", occurrence.id);

    let (status, body) = app.post(&uri, &token, json!({"status": "ACCEPTED"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["allowed"], json!(["IN_PROGRESS", "CANCELED"]));

    let (status, body) = app.post(&uri, &token, json!({"status": "LOST"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["allowed"].as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn test_terminal_occurrence_rejects_changes() {
    let app = TestApp::new();
    let occurrence = app.open(app.hospital).await;
    app.move_to(occurrence.id, &[OccurrenceStatus::Canceled]).await;
    let token = app.operator_token();

    let (status, body) = app
        .post(
            &format!("/v1/occurrences/{}/status", occurrence.id),
            &token,
            json!({"status": "IN_PROGRESS"}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_conclude_requires_outcome() {
    let app = TestApp::new();
    let occurrence = app.open(app.hospital).await;
    app.move_to(
        occurrence.id,
        &[OccurrenceStatus::InProgress, OccurrenceStatus::Accepted],
    )
    .await;
    let token = app.operator_token();
    let status_uri = format!("/v1/occurrences/{}/status", occurrence.id);
    let outcome_uri = format!("/v1/occurrences/{}/outcome", occurrence.id);

    let (status, body) = app
        .post(&status_uri, &token, json!({"status": "CONCLUDED"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["hint"].is_string());

    let (status, body) = app
        .post(
            &outcome_uri,
            &token,
            json!({"outcome": "donation_successful", "notes": "kidneys"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["outcome"], "donation_successful");

    let (status, _) = app
        .post(&outcome_uri, &token, json!({"outcome": "other"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .post(&status_uri, &token, json!({"status": "CONCLUDED"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CONCLUDED");
    assert_eq!(body["allowed_transitions"], json!([]));
}

#[tokio::test]
async fn test_outcome_rejected_before_decision() {
    let app = TestApp::new();
    let occurrence = app.open(app.hospital).await;
    let token = app.operator_token();

    let (status, _) = app
        .post(
            &format!("/v1/occurrences/{}/outcome", occurrence.id),
            &token,
            json!({"outcome": "family_refused"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_hospital_urgency_summary() {
    let app = TestApp::new();
    let first = app.open(app.hospital).await;
    app.open(app.hospital).await;
    let closed = app.open(app.hospital).await;
    app.move_to(closed.id, &[OccurrenceStatus::Canceled]).await;
    app.open(Uuid::now_v7()).await;
    let token = app.operator_token();

    let (status, body) = app
        .get(&format!("/v1/hospitals/{}/urgency", app.hospital), Some(&token))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], 2);
    assert_eq!(body["urgency"], "GREEN");
    let ids: Vec<&str> = body["occurrences"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|o| o["id"].as_str())
        .collect();
    assert!(ids.contains(&first.id.to_string().as_str()));
    assert!(!ids.contains(&closed.id.to_string().as_str()));

    let (status, _) = app
        .get(&format!("/v1/hospitals/{}/urgency", Uuid::now_v7()), Some(&token))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_accepts_query_token() {
    let app = TestApp::new();
    let token = app.operator_token();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v1/notifications/stream?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(app.state.hub.registry().count(), 1);

    drop(response);
    assert_eq!(app.state.hub.registry().count(), 0);

    let (status, _) = app.get("/v1/notifications/stream", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
