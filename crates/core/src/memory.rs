//! In-memory collaborator implementations
//!
//! Used by tests and when the server runs without `DATABASE_URL`. They keep
//! the same semantics as the PostgreSQL implementations (dedup on
//! hospital + event id, compare-and-set status writes, immutable completed
//! notification records).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{EmitError, StoreError, StoreResult};
use crate::notification::{
    ChannelPreferences, HubSignal, NotificationRecord, NotificationStatus, Operator,
};
use crate::occurrence::{Occurrence, OccurrenceFilter, OccurrenceHistory, OccurrenceStatus};
use crate::rules::RuleDefinition;
use crate::traits::{
    HistoryStore, NotificationStore, OccurrenceStore, PreferenceDirectory, RuleProvider,
    ShiftDirectory, SignalEmitter,
};

// ============================================================================
// Occurrences
// ============================================================================

#[derive(Default)]
pub struct InMemoryOccurrenceStore {
    occurrences: RwLock<HashMap<Uuid, Occurrence>>,
    fail_creates: AtomicU32,
    fail_lookups: AtomicU32,
}

impl InMemoryOccurrenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` creates fail with a database error (for testing)
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` dedup lookups fail with a database error (for testing)
    pub fn fail_next_lookups(&self, n: u32) {
        self.fail_lookups.store(n, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.occurrences.read().len()
    }
}

#[async_trait]
impl OccurrenceStore for InMemoryOccurrenceStore {
    async fn create(&self, occurrence: &Occurrence) -> StoreResult<()> {
        let injected = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Database("injected create failure".into()));
        }

        let mut occurrences = self.occurrences.write();
        let duplicate = occurrences.values().any(|o| {
            o.hospital_id == occurrence.hospital_id && o.event_id == occurrence.event_id
        });
        if duplicate {
            return Err(StoreError::DuplicateOccurrence {
                hospital_id: occurrence.hospital_id,
                event_id: occurrence.event_id.clone(),
            });
        }
        occurrences.insert(occurrence.id, occurrence.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Occurrence>> {
        Ok(self.occurrences.read().get(&id).cloned())
    }

    async fn exists_for_event(&self, hospital_id: Uuid, event_id: &str) -> StoreResult<bool> {
        let injected = self
            .fail_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Database("injected lookup failure".into()));
        }

        Ok(self
            .occurrences
            .read()
            .values()
            .any(|o| o.hospital_id == hospital_id && o.event_id == event_id))
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: OccurrenceStatus,
        next: OccurrenceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Occurrence> {
        let mut occurrences = self.occurrences.write();
        let occurrence = occurrences
            .get_mut(&id)
            .ok_or(StoreError::OccurrenceNotFound(id))?;
        if occurrence.status != expected {
            return Err(StoreError::StaleStatus {
                id,
                expected,
                actual: occurrence.status,
            });
        }
        occurrence.status = next;
        occurrence.updated_at = at;
        Ok(occurrence.clone())
    }

    async fn mark_notified(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut occurrences = self.occurrences.write();
        let occurrence = occurrences
            .get_mut(&id)
            .ok_or(StoreError::OccurrenceNotFound(id))?;
        occurrence.notified_at = Some(at);
        Ok(())
    }

    async fn list(&self, filter: &OccurrenceFilter) -> StoreResult<Vec<Occurrence>> {
        let mut matched: Vec<Occurrence> = self
            .occurrences
            .read()
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.priority_score.cmp(&a.priority_score).then(a.created_at.cmp(&b.created_at)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

// ============================================================================
// History
// ============================================================================

#[derive(Default)]
pub struct InMemoryHistoryStore {
    entries: RwLock<HashMap<Uuid, Vec<OccurrenceHistory>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, entry: &OccurrenceHistory) -> StoreResult<()> {
        self.entries
            .write()
            .entry(entry.occurrence_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list(&self, occurrence_id: Uuid) -> StoreResult<Vec<OccurrenceHistory>> {
        Ok(self
            .entries
            .read()
            .get(&occurrence_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_outcome(&self, occurrence_id: Uuid) -> StoreResult<Option<OccurrenceHistory>> {
        Ok(self
            .entries
            .read()
            .get(&occurrence_id)
            .and_then(|entries| entries.iter().find(|e| e.outcome.is_some()).cloned()))
    }
}

// ============================================================================
// Notification records
// ============================================================================

#[derive(Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<Vec<NotificationRecord>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<NotificationRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn create(&self, record: &NotificationRecord) -> StoreResult<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<NotificationRecord> {
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotificationNotFound(id))?;
        if record.status.is_terminal() {
            return Err(StoreError::RecordCompleted(id));
        }
        record.status = status;
        record.error = error;
        record.completed_at = Some(at);
        Ok(record.clone())
    }

    async fn list_for_occurrence(&self, occurrence_id: Uuid) -> StoreResult<Vec<NotificationRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.occurrence_id == occurrence_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Rule provider
// ============================================================================

/// Rule provider backed by a map, with a switch to simulate outages
#[derive(Default)]
pub struct StaticRuleProvider {
    rules: RwLock<HashMap<Uuid, Vec<RuleDefinition>>>,
    unavailable: Mutex<bool>,
    calls: AtomicUsize,
}

impl StaticRuleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rules(&self, tenant_id: Uuid, rules: Vec<RuleDefinition>) {
        self.rules.write().insert(tenant_id, rules);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    /// Number of `active_rules` calls served
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleProvider for StaticRuleProvider {
    async fn active_rules(&self, tenant_id: Uuid) -> StoreResult<Vec<RuleDefinition>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.unavailable.lock() {
            return Err(StoreError::Database("rule provider unavailable".into()));
        }
        Ok(self
            .rules
            .read()
            .get(&tenant_id)
            .map(|rules| rules.iter().filter(|r| r.active).cloned().collect())
            .unwrap_or_default())
    }
}

// ============================================================================
// Shift and preference lookups
// ============================================================================

struct Shift {
    operator: Operator,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryShiftDirectory {
    shifts: RwLock<HashMap<Uuid, Vec<Shift>>>,
    managers: RwLock<HashMap<Uuid, Vec<Operator>>>,
}

impl InMemoryShiftDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shift covering `[starts_at, ends_at)`
    pub fn add_shift(
        &self,
        hospital_id: Uuid,
        operator: Operator,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) {
        self.shifts.write().entry(hospital_id).or_default().push(Shift {
            operator,
            starts_at,
            ends_at,
        });
    }

    /// Link a manager to the hospital as an off-shift fallback
    pub fn add_manager(&self, hospital_id: Uuid, operator: Operator) {
        self.managers
            .write()
            .entry(hospital_id)
            .or_default()
            .push(operator);
    }
}

#[async_trait]
impl ShiftDirectory for InMemoryShiftDirectory {
    async fn on_duty(&self, hospital_id: Uuid, at: DateTime<Utc>) -> StoreResult<Vec<Operator>> {
        Ok(self
            .shifts
            .read()
            .get(&hospital_id)
            .map(|shifts| {
                shifts
                    .iter()
                    .filter(|s| s.starts_at <= at && at < s.ends_at)
                    .map(|s| s.operator.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fallback_managers(&self, hospital_id: Uuid) -> StoreResult<Vec<Operator>> {
        Ok(self
            .managers
            .read()
            .get(&hospital_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryPreferenceDirectory {
    preferences: RwLock<HashMap<Uuid, ChannelPreferences>>,
    push_tokens: RwLock<HashMap<Uuid, Vec<String>>>,
}

impl InMemoryPreferenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_preferences(&self, user_id: Uuid, preferences: ChannelPreferences) {
        self.preferences.write().insert(user_id, preferences);
    }

    pub fn add_push_token(&self, user_id: Uuid, token: impl Into<String>) {
        self.push_tokens
            .write()
            .entry(user_id)
            .or_default()
            .push(token.into());
    }
}

#[async_trait]
impl PreferenceDirectory for InMemoryPreferenceDirectory {
    async fn preferences(&self, user_id: Uuid) -> StoreResult<ChannelPreferences> {
        Ok(self
            .preferences
            .read()
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn push_tokens(&self, user_id: Uuid) -> StoreResult<Vec<String>> {
        Ok(self
            .push_tokens
            .read()
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Emitters
// ============================================================================

/// Discards every signal
#[derive(Debug, Default, Clone)]
pub struct NoopEmitter;

#[async_trait]
impl SignalEmitter for NoopEmitter {
    async fn emit(&self, _signal: HubSignal) -> Result<(), EmitError> {
        Ok(())
    }
}

/// Collects signals in memory for assertions
#[derive(Default)]
pub struct CollectingEmitter {
    signals: Mutex<Vec<HubSignal>>,
}

impl CollectingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<HubSignal> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl SignalEmitter for CollectingEmitter {
    async fn emit(&self, signal: HubSignal) -> Result<(), EmitError> {
        self.signals.lock().push(signal);
        Ok(())
    }
}
