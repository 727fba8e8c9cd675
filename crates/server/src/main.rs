// Vigil server
// Decision: One process runs the ingestor, the hub broadcast loop and the HTTP surface
// Decision: A single CancellationToken drives graceful shutdown of every background task

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use vigil_core::{
    HistoryStore, InMemoryHistoryStore, InMemoryNotificationStore, InMemoryOccurrenceStore,
    InMemoryPreferenceDirectory, InMemoryShiftDirectory, NotificationStore, OccurrenceLifecycle,
    OccurrenceStore, PostgresStore, PreferenceDirectory, RuleProvider, ShiftDirectory,
    StaticRuleProvider, TracingAuditSink, TriageEngine,
};
use vigil_pipeline::{
    build_senders, Dispatcher, EventIngestor, EventStream, HubConfig, InMemoryEventStream,
    NotificationHub, PipelineConfig, PostgresEventStream, RetryPolicy, RuleSetCache,
    SenderConfig,
};
use vigil_server::telemetry::{init_telemetry, TelemetryConfig};
use vigil_server::{build_app, AppState, JwtVerifier, ServerConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

struct Collaborators {
    occurrences: Arc<dyn OccurrenceStore>,
    history: Arc<dyn HistoryStore>,
    notifications: Arc<dyn NotificationStore>,
    rules: Arc<dyn RuleProvider>,
    shifts: Arc<dyn ShiftDirectory>,
    preferences: Arc<dyn PreferenceDirectory>,
    stream: Arc<dyn EventStream>,
}

async fn postgres_collaborators(config: &ServerConfig, url: &str) -> Result<Collaborators> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(url)
        .await
        .context("Failed to connect to database")?;
    let store = Arc::new(PostgresStore::new(pool.clone()));
    store.ping().await.context("Database ping failed")?;

    let stream = PostgresEventStream::new(pool);
    stream
        .check()
        .await
        .context("death_events outbox table is not reachable")?;
    tracing::info!("Connected to database");

    Ok(Collaborators {
        occurrences: store.clone(),
        history: store.clone(),
        notifications: store.clone(),
        rules: store.clone(),
        shifts: store.clone(),
        preferences: store,
        stream: Arc::new(stream),
    })
}

fn memory_collaborators() -> Collaborators {
    tracing::warn!("DATABASE_URL not set, running with in-memory collaborators (data is not persisted)");
    Collaborators {
        occurrences: Arc::new(InMemoryOccurrenceStore::new()),
        history: Arc::new(InMemoryHistoryStore::new()),
        notifications: Arc::new(InMemoryNotificationStore::new()),
        rules: Arc::new(StaticRuleProvider::new()),
        shifts: Arc::new(InMemoryShiftDirectory::new()),
        preferences: Arc::new(InMemoryPreferenceDirectory::new()),
        stream: Arc::new(InMemoryEventStream::new()),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_telemetry(&TelemetryConfig::from_env());
    tracing::info!("vigil-server starting...");

    let config = ServerConfig::from_env()?;
    if config.uses_dev_secret() {
        tracing::warn!("JWT_SECRET not set, using the development secret");
    }
    let pipeline_config = PipelineConfig::from_env();
    let hub_config = HubConfig::from_env();
    let sender_config = SenderConfig::from_env();
    tracing::info!(
        channels = ?sender_config.configured_channels(),
        window_hours = pipeline_config.window_hours,
        "Pipeline configured"
    );

    let collaborators = match &config.database_url {
        Some(url) => postgres_collaborators(&config, url).await?,
        None => memory_collaborators(),
    };

    let send_retry = RetryPolicy::exponential()
        .with_max_attempts(hub_config.send_max_attempts)
        .with_max_interval(Duration::from_secs(1));
    let senders = build_senders(&sender_config, hub_config.send_timeout, send_retry)
        .context("Failed to build channel senders")?;
    let dispatcher = Dispatcher::new(
        collaborators.shifts.clone(),
        collaborators.preferences.clone(),
        collaborators.notifications.clone(),
        collaborators.occurrences.clone(),
        senders,
    )
    .with_send_timeout(hub_config.delivery_deadline())
    .with_dashboard_url(hub_config.dashboard_url.clone());
    let (hub, hub_handle) = NotificationHub::new(&hub_config, dispatcher);

    let lifecycle = Arc::new(OccurrenceLifecycle::new(
        collaborators.occurrences.clone(),
        collaborators.history.clone(),
        Arc::new(hub_handle),
        Arc::new(TracingAuditSink),
    ));
    let engine = Arc::new(TriageEngine::new());
    let rules = Arc::new(RuleSetCache::new(
        collaborators.rules.clone(),
        pipeline_config.rules_cache_ttl,
    ));
    let ingestor = Arc::new(EventIngestor::new(
        collaborators.stream.clone(),
        collaborators.occurrences.clone(),
        lifecycle.clone(),
        rules,
        engine.clone(),
        pipeline_config,
    ));

    let cancel = CancellationToken::new();
    let hub_task = {
        let hub = hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.run(cancel).await {
                tracing::error!(error = %e, "Notification hub failed");
            }
        })
    };
    let ingestor_task = {
        let ingestor = ingestor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ingestor.run(cancel).await })
    };

    let state = AppState {
        occurrences: collaborators.occurrences.clone(),
        history: collaborators.history.clone(),
        lifecycle,
        ingestor,
        engine,
        hub,
        verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
    };
    let app = build_app(state, &config);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;
    tracing::info!("HTTP server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("Server error")?;

    cancel.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for (task, handle) in [("ingestor", ingestor_task), ("hub", hub_task)] {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(task, error = %e, "Background task panicked");
                } else {
                    tracing::warn!(task, error = %e, "Background task was cancelled");
                }
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Background tasks did not stop within the shutdown grace period");
    }
    tracing::info!("vigil-server stopped");
    Ok(())
}
