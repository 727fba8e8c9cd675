// Vigil Core
//
// Domain model and decision logic for the detection-to-alert pipeline:
// - RawDeathEvent parsing and validation
// - RuleSet decoding and the TriageEngine
// - UrgencyClassifier over the capture window
// - Occurrence model and the OccurrenceLifecycle state machine
// - Collaborator traits with in-memory and PostgreSQL implementations
//
// Note: This crate has no dependency on the pipeline or HTTP layers.

pub mod audit;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod memory;
pub mod notification;
pub mod occurrence;
pub mod postgres;
pub mod rules;
pub mod traits;
pub mod triage;
pub mod urgency;

pub use audit::{AuditEntry, TracingAuditSink};
pub use error::{EmitError, StoreError, StoreResult};
pub use event::{EventOrigin, RawDeathEvent, ValidationError};
pub use lifecycle::{LifecycleError, OccurrenceLifecycle, TransitionRequest};
pub use memory::{
    CollectingEmitter, InMemoryHistoryStore, InMemoryNotificationStore, InMemoryOccurrenceStore,
    InMemoryPreferenceDirectory, InMemoryShiftDirectory, NoopEmitter, StaticRuleProvider,
};
pub use notification::{
    ChannelPreferences, HubSignal, NotificationChannel, NotificationRecord, NotificationStatus,
    Operator,
};
pub use occurrence::{
    mask_name, window_deadline, HistoryAction, Occurrence, OccurrenceFilter, OccurrenceHistory,
    OccurrenceStatus, OutcomeType, PatientRecord, MAX_WINDOW_HOURS,
};
pub use postgres::PostgresStore;
pub use rules::{Rule, RuleAction, RuleDecodeError, RuleDefinition, RuleKind, RuleSet, SectorScores};
pub use traits::{
    AuditSink, HistoryStore, NotificationStore, OccurrenceStore, PreferenceDirectory,
    RuleProvider, ShiftDirectory, SignalEmitter,
};
pub use triage::{Rejection, TriageEngine, TriageStats, Verdict};
pub use urgency::Urgency;
