//! Live session registry
//!
//! Each session owns a bounded queue. When a slow consumer's queue is full the
//! oldest pending event is dropped, so the broadcaster never blocks. The
//! registry map and counters sit behind one mutex; pushes are non-blocking
//! and happen while it is held.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

/// Caller role carried by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Operator,
    Manager,
    Admin,
}

impl FromStr for SessionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "operator" | "operador" => Ok(SessionRole::Operator),
            "manager" | "gestor" => Ok(SessionRole::Manager),
            "admin" => Ok(SessionRole::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionRole::Operator => "operator",
            SessionRole::Manager => "manager",
            SessionRole::Admin => "admin",
        })
    }
}

/// What a session is allowed to see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionScope {
    pub user_id: Uuid,
    pub role: SessionRole,
    pub tenant_id: Uuid,
    /// None means every hospital of the tenant (managers and admins)
    pub hospital_id: Option<Uuid>,
}

impl SessionScope {
    pub fn admits(&self, event: &LiveEvent) -> bool {
        if event.tenant_id.is_some_and(|t| t != self.tenant_id) {
            return false;
        }
        match (self.hospital_id, event.hospital_id) {
            (Some(mine), Some(theirs)) => mine == theirs,
            (Some(_), None) => event.tenant_id.is_none(),
            (None, _) => true,
        }
    }
}

/// A message pushed to live sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hospital_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LiveEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            tenant_id: None,
            hospital_id: None,
            occurrence_id: None,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn scoped(mut self, tenant_id: Uuid, hospital_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self.hospital_id = Some(hospital_id);
        self
    }

    pub fn for_occurrence(mut self, occurrence_id: Uuid) -> Self {
        self.occurrence_id = Some(occurrence_id);
        self
    }
}

/// Result of offering an event to one session queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedOldest,
    Closed,
}

struct SessionQueue {
    buffer: Mutex<VecDeque<LiveEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SessionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: LiveEvent) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut buffer = self.buffer.lock();
            let outcome = if buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            buffer.push_back(event);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Returns true only for the call that actually closed the queue
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.buffer.lock().clear();
        self.notify.notify_one();
        true
    }

    async fn recv(&self) -> Option<LiveEvent> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(event) = self.buffer.lock().pop_front() {
                return Some(event);
            }
            self.notify.notified().await;
        }
    }
}

/// Public view of a registered session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub scope: SessionScope,
    pub connected_at: DateTime<Utc>,
}

struct SessionEntry {
    info: SessionInfo,
    queue: Arc<SessionQueue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<Uuid, SessionEntry>,
    total_connections: u64,
    events_dropped: u64,
}

/// Concurrent-safe map of live sessions
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    buffer: usize,
}

impl SessionRegistry {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner::default()),
            buffer,
        })
    }

    /// Register a session. Its first queued event is "connected".
    pub fn register(self: &Arc<Self>, scope: SessionScope) -> SessionHandle {
        let id = Uuid::now_v7();
        let connected_at = Utc::now();
        let queue = Arc::new(SessionQueue::new(self.buffer));
        queue.push(LiveEvent::new(
            "connected",
            serde_json::json!({
                "session_id": id,
                "user_id": scope.user_id,
                "timestamp": connected_at,
            }),
        ));

        let info = SessionInfo {
            id,
            scope,
            connected_at,
        };
        {
            let mut inner = self.inner.lock();
            inner.sessions.insert(
                id,
                SessionEntry {
                    info: info.clone(),
                    queue: queue.clone(),
                },
            );
            inner.total_connections += 1;
        }
        info!(session_id = %id, user_id = %info.scope.user_id, role = %info.scope.role, "Session registered");

        SessionHandle {
            info,
            queue,
            registry: self.clone(),
        }
    }

    /// Remove a session and close its queue. Returns false if it was already gone.
    pub fn unregister(&self, id: Uuid) -> bool {
        let entry = self.inner.lock().sessions.remove(&id);
        match entry {
            Some(entry) => {
                entry.queue.close();
                info!(session_id = %id, "Session unregistered");
                true
            }
            None => false,
        }
    }

    /// Push an event to every session whose scope admits it
    pub fn broadcast(&self, event: &LiveEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut inner = self.inner.lock();
        for entry in inner.sessions.values() {
            if !entry.info.scope.admits(event) {
                continue;
            }
            match entry.queue.push(event.clone()) {
                PushOutcome::Queued => report.delivered += 1,
                PushOutcome::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped += 1;
                    debug!(session_id = %entry.info.id, "Session queue full, dropped oldest event");
                }
                PushOutcome::Closed => {}
            }
        }
        inner.events_dropped += report.dropped as u64;
        report
    }

    pub fn count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn total_connections(&self) -> u64 {
        self.inner.lock().total_connections
    }

    pub fn events_dropped(&self) -> u64 {
        self.inner.lock().events_dropped
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .lock()
            .sessions
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Close every session (process shutdown)
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.inner.lock().sessions.drain().collect();
        for (_, entry) in &drained {
            entry.queue.close();
        }
        drained.len()
    }
}

/// Receiving side of a session. Dropping it unregisters the session.
pub struct SessionHandle {
    info: SessionInfo,
    queue: Arc<SessionQueue>,
    registry: Arc<SessionRegistry>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Next event, or None once the session has been closed
    pub async fn recv(&self) -> Option<LiveEvent> {
        self.queue.recv().await
    }

    /// Events dropped from this session because it fell behind
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.unregister(self.info.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scope(tenant_id: Uuid, hospital_id: Option<Uuid>) -> SessionScope {
        SessionScope {
            user_id: Uuid::now_v7(),
            role: if hospital_id.is_some() {
                SessionRole::Operator
            } else {
                SessionRole::Manager
            },
            tenant_id,
            hospital_id,
        }
    }

    fn event(tenant_id: Uuid, hospital_id: Uuid) -> LiveEvent {
        LiveEvent::new("new-occurrence", serde_json::json!({})).scoped(tenant_id, hospital_id)
    }

    #[tokio::test]
    async fn test_connected_event_first() {
        let registry = SessionRegistry::new(10);
        let handle = registry.register(scope(Uuid::nil(), Some(Uuid::now_v7())));
        let first = handle.recv().await.unwrap();
        assert_eq!(first.event_type, "connected");
        assert_eq!(first.payload["session_id"], serde_json::json!(handle.id()));
    }

    #[tokio::test]
    async fn test_hospital_scoping() {
        let registry = SessionRegistry::new(10);
        let tenant = Uuid::now_v7();
        let hospital_a = Uuid::now_v7();
        let hospital_b = Uuid::now_v7();
        let a = registry.register(scope(tenant, Some(hospital_a)));
        let manager = registry.register(scope(tenant, None));
        a.recv().await.unwrap();
        manager.recv().await.unwrap();

        let report = registry.broadcast(&event(tenant, hospital_b));
        assert_eq!(report.delivered, 1);

        let report = registry.broadcast(&event(tenant, hospital_a));
        assert_eq!(report.delivered, 2);

        let received = a.recv().await.unwrap();
        assert_eq!(received.hospital_id, Some(hospital_a));
        assert_eq!(manager.recv().await.unwrap().hospital_id, Some(hospital_b));
    }

    #[tokio::test]
    async fn test_tenant_scoping() {
        let registry = SessionRegistry::new(10);
        let manager = registry.register(scope(Uuid::now_v7(), None));
        let report = registry.broadcast(&event(Uuid::now_v7(), Uuid::now_v7()));
        assert_eq!(report.delivered, 0);
        drop(manager);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let registry = SessionRegistry::new(2);
        let tenant = Uuid::now_v7();
        let hospital = Uuid::now_v7();
        let handle = registry.register(scope(tenant, Some(hospital)));

        // queue holds "connected" + e1; e2 evicts "connected"
        let e1 = event(tenant, hospital);
        let e2 = event(tenant, hospital);
        registry.broadcast(&e1);
        let report = registry.broadcast(&e2);
        assert_eq!(report.dropped, 1);

        assert_eq!(handle.recv().await.unwrap().id, e1.id);
        assert_eq!(handle.recv().await.unwrap().id, e2.id);
        assert_eq!(handle.dropped(), 1);
        assert_eq!(registry.events_dropped(), 1);
    }

    #[tokio::test]
    async fn test_drop_unregisters_once() {
        let registry = SessionRegistry::new(4);
        let handle = registry.register(scope(Uuid::nil(), None));
        let id = handle.id();
        assert_eq!(registry.count(), 1);
        drop(handle);
        assert_eq!(registry.count(), 0);
        assert!(!registry.unregister(id));
        assert_eq!(registry.total_connections(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_receiver() {
        let registry = SessionRegistry::new(4);
        let handle = registry.register(scope(Uuid::nil(), None));
        handle.recv().await.unwrap();

        let waiter = tokio::spawn(async move { handle.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.close_all(), 1);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("gestor".parse::<SessionRole>().unwrap(), SessionRole::Manager);
        assert_eq!("Operator".parse::<SessionRole>().unwrap(), SessionRole::Operator);
        assert!("guest".parse::<SessionRole>().is_err());
    }
}
