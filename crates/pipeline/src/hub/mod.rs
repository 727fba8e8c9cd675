//! Notification hub
//!
//! A single broadcast loop consumes [`HubSignal`]s in arrival order, turns
//! each into a [`LiveEvent`] for the scoped sessions, and hands new
//! occurrences to the [`Dispatcher`] for per-channel delivery. Dispatch runs
//! on tracked tasks so slow providers never delay the live broadcast.

mod dispatch;
mod session;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use vigil_core::{EmitError, HubSignal, Occurrence, SignalEmitter};

pub use dispatch::{DispatchCounters, DispatchReport, Dispatcher};
pub use session::{
    BroadcastReport, LiveEvent, PushOutcome, SessionHandle, SessionInfo, SessionRegistry, SessionRole,
    SessionScope,
};

use crate::config::HubConfig;

const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HubError {
    #[error("notification hub already started")]
    AlreadyStarted,
}

/// Hub health snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub running: bool,
    pub sessions: usize,
    pub total_connections: u64,
    pub total_broadcasts: u64,
    pub events_dropped: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

/// Sending side of the hub. Cloned into the lifecycle as its emitter.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubSignal>,
}

#[async_trait]
impl SignalEmitter for HubHandle {
    async fn emit(&self, signal: HubSignal) -> Result<(), EmitError> {
        self.tx.send(signal).await.map_err(|_| EmitError::Closed)
    }
}

pub struct NotificationHub {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    signals: Mutex<Option<mpsc::Receiver<HubSignal>>>,
    tracker: TaskTracker,
    running: AtomicBool,
    total_broadcasts: AtomicU64,
}

impl NotificationHub {
    pub fn new(config: &HubConfig, dispatcher: Dispatcher) -> (Arc<Self>, HubHandle) {
        let (tx, rx) = mpsc::channel(config.signal_buffer.max(1));
        let hub = Arc::new(Self {
            registry: SessionRegistry::new(config.session_buffer),
            dispatcher: Arc::new(dispatcher),
            signals: Mutex::new(Some(rx)),
            tracker: TaskTracker::new(),
            running: AtomicBool::new(false),
            total_broadcasts: AtomicU64::new(0),
        });
        (hub, HubHandle { tx })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a live session; its first event is "connected"
    pub fn subscribe(&self, scope: SessionScope) -> SessionHandle {
        self.registry.register(scope)
    }

    pub fn stats(&self) -> HubStats {
        let counters = self.dispatcher.counters();
        HubStats {
            running: self.running.load(Ordering::Acquire),
            sessions: self.registry.count(),
            total_connections: self.registry.total_connections(),
            total_broadcasts: self.total_broadcasts.load(Ordering::Relaxed),
            events_dropped: self.registry.events_dropped(),
            notifications_sent: counters.sent,
            notifications_failed: counters.failed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Broadcast loop. Returns when cancelled or when every handle is dropped.
    /// Can only be run once.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), HubError> {
        let mut rx = self.signals.lock().take().ok_or(HubError::AlreadyStarted)?;
        self.running.store(true, Ordering::Release);
        info!("Notification hub started");

        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = rx.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            self.handle(signal);
        }

        self.running.store(false, Ordering::Release);
        let closed = self.registry.close_all();
        self.tracker.close();
        if tokio::time::timeout(DISPATCH_DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Pending notification dispatches did not finish before shutdown");
        }
        info!(sessions_closed = closed, "Notification hub stopped");
        Ok(())
    }

    fn handle(&self, signal: HubSignal) {
        let event = live_event(&signal);
        let report = self.registry.broadcast(&event);
        self.total_broadcasts.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_type = %event.event_type,
            occurrence_id = %signal.occurrence().id,
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast live event"
        );

        if let HubSignal::OccurrenceCreated { occurrence } = signal {
            let dispatcher = self.dispatcher.clone();
            self.tracker.spawn(async move {
                dispatcher.dispatch_new(&occurrence, report.delivered).await;
            });
        }
    }
}

/// Dashboard view of an occurrence. Carries the masked name only.
fn occurrence_payload(occurrence: &Occurrence) -> serde_json::Value {
    let now = Utc::now();
    json!({
        "id": occurrence.id,
        "hospital_id": occurrence.hospital_id,
        "hospital_name": occurrence.patient.hospital_name,
        "status": occurrence.status,
        "priority_score": occurrence.priority_score,
        "patient": occurrence.masked_patient_name,
        "sector": occurrence.patient.sector,
        "death_at": occurrence.death_at,
        "window_expires_at": occurrence.window_expires_at,
        "time_remaining": occurrence.format_time_remaining(now),
        "urgency": occurrence.urgency(now),
    })
}

pub fn live_event(signal: &HubSignal) -> LiveEvent {
    let occurrence = signal.occurrence();
    let mut payload = json!({ "occurrence": occurrence_payload(occurrence) });
    match signal {
        HubSignal::OccurrenceCreated { .. } => {}
        HubSignal::StatusChanged { previous, actor, .. } => {
            payload["previous_status"] = json!(previous);
            payload["actor"] = json!(actor);
        }
        HubSignal::OutcomeRegistered { outcome, actor, .. } => {
            payload["outcome"] = json!(outcome);
            payload["actor"] = json!(actor);
        }
    }
    LiveEvent::new(signal.event_type(), payload)
        .scoped(occurrence.tenant_id, occurrence.hospital_id)
        .for_occurrence(occurrence.id)
}
