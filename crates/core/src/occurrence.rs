// Occurrence model
//
// An Occurrence is the tracked case created once triage accepts a death event.
// Decision: window_expires_at is computed once at creation and stored, never recomputed
// Decision: the full patient payload travels with the occurrence but list views only
//           expose the masked name

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::urgency::Urgency;

/// Longest capture window accepted from rules or configuration (one year)
pub const MAX_WINDOW_HOURS: u32 = 8760;

/// `death_at + window_hours`, with hours capped at [`MAX_WINDOW_HOURS`] and the
/// result saturating at the latest representable instant
pub fn window_deadline(death_at: DateTime<Utc>, window_hours: u32) -> DateTime<Utc> {
    let hours = Duration::hours(i64::from(window_hours.min(MAX_WINDOW_HOURS)));
    death_at
        .checked_add_signed(hours)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lifecycle status of an occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccurrenceStatus {
    Pending,
    InProgress,
    Accepted,
    Refused,
    Concluded,
    Canceled,
}

impl OccurrenceStatus {
    pub const ALL: [OccurrenceStatus; 6] = [
        OccurrenceStatus::Pending,
        OccurrenceStatus::InProgress,
        OccurrenceStatus::Accepted,
        OccurrenceStatus::Refused,
        OccurrenceStatus::Concluded,
        OccurrenceStatus::Canceled,
    ];

    /// Targets reachable from this status in a single transition
    pub fn allowed_targets(self) -> &'static [OccurrenceStatus] {
        use OccurrenceStatus::*;
        match self {
            Pending => &[InProgress, Canceled],
            InProgress => &[Accepted, Refused, Canceled],
            Accepted => &[Concluded, Canceled],
            Refused => &[Concluded, Canceled],
            Concluded | Canceled => &[],
        }
    }

    pub fn can_transition_to(self, target: OccurrenceStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OccurrenceStatus::Concluded | OccurrenceStatus::Canceled)
    }

    /// Outcome registration is only legal in these states
    pub fn accepts_outcome(self) -> bool {
        matches!(self, OccurrenceStatus::Accepted | OccurrenceStatus::Refused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OccurrenceStatus::Pending => "PENDING",
            OccurrenceStatus::InProgress => "IN_PROGRESS",
            OccurrenceStatus::Accepted => "ACCEPTED",
            OccurrenceStatus::Refused => "REFUSED",
            OccurrenceStatus::Concluded => "CONCLUDED",
            OccurrenceStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for OccurrenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OccurrenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        OccurrenceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("unknown occurrence status: {s}"))
    }
}

/// Final resolution recorded before an occurrence can be concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    DonationSuccessful,
    FamilyRefused,
    MedicalContraindication,
    WindowExpired,
    Other,
}

impl OutcomeType {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeType::DonationSuccessful => "donation_successful",
            OutcomeType::FamilyRefused => "family_refused",
            OutcomeType::MedicalContraindication => "medical_contraindication",
            OutcomeType::WindowExpired => "window_expired",
            OutcomeType::Other => "other",
        }
    }
}

impl fmt::Display for OutcomeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "donation_successful" => Ok(OutcomeType::DonationSuccessful),
            "family_refused" => Ok(OutcomeType::FamilyRefused),
            "medical_contraindication" => Ok(OutcomeType::MedicalContraindication),
            "window_expired" => Ok(OutcomeType::WindowExpired),
            "other" => Ok(OutcomeType::Other),
            _ => Err(format!("unknown outcome type: {s}")),
        }
    }
}

/// Full patient payload (LGPD-restricted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    pub cause_of_death: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medical_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hospital_name: Option<String>,
    pub unknown_identity: bool,
    pub detected_at: DateTime<Utc>,
}

/// A tracked case for an accepted death event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// External id of the source event (dedup key together with hospital_id)
    pub event_id: String,
    pub hospital_id: Uuid,
    pub status: OccurrenceStatus,
    /// Priority score in 0..=100
    pub priority_score: u8,
    pub masked_patient_name: String,
    pub patient: PatientRecord,
    pub death_at: DateTime<Utc>,
    pub window_expires_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Occurrence {
    /// Build a new PENDING occurrence. The capture window is fixed here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: Uuid,
        event_id: impl Into<String>,
        hospital_id: Uuid,
        priority_score: u8,
        patient: PatientRecord,
        death_at: DateTime<Utc>,
        window_hours: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            event_id: event_id.into(),
            hospital_id,
            status: OccurrenceStatus::Pending,
            priority_score: priority_score.min(100),
            masked_patient_name: mask_name(&patient.name),
            patient,
            death_at,
            window_expires_at: window_deadline(death_at, window_hours),
            notified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Time left in the capture window, never negative
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        let remaining = self.window_expires_at - now;
        if remaining < Duration::zero() {
            Duration::zero()
        } else {
            remaining
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_expires_at
    }

    /// Human-readable remaining time: "5h 2min", "45min" or "expired"
    pub fn format_time_remaining(&self, now: DateTime<Utc>) -> String {
        if self.is_expired(now) {
            return "expired".to_string();
        }
        let remaining = self.time_remaining(now);
        let hours = remaining.num_hours();
        let minutes = remaining.num_minutes() % 60;
        if hours > 0 {
            format!("{hours}h {minutes}min")
        } else {
            format!("{minutes}min")
        }
    }

    pub fn urgency(&self, now: DateTime<Utc>) -> Urgency {
        Urgency::classify(self.window_expires_at, now)
    }

    pub fn sector(&self) -> Option<&str> {
        self.patient.sector.as_deref()
    }
}

/// Filter for listing occurrences
#[derive(Debug, Clone, Default)]
pub struct OccurrenceFilter {
    pub tenant_id: Option<Uuid>,
    pub hospital_id: Option<Uuid>,
    pub statuses: Option<Vec<OccurrenceStatus>>,
    /// Exclude CONCLUDED and CANCELED
    pub active_only: bool,
    pub limit: Option<usize>,
}

impl OccurrenceFilter {
    pub fn for_hospital(hospital_id: Uuid) -> Self {
        Self {
            hospital_id: Some(hospital_id),
            ..Default::default()
        }
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, occurrence: &Occurrence) -> bool {
        if self.tenant_id.is_some_and(|t| t != occurrence.tenant_id) {
            return false;
        }
        if self.hospital_id.is_some_and(|h| h != occurrence.hospital_id) {
            return false;
        }
        if self.active_only && occurrence.status.is_terminal() {
            return false;
        }
        match &self.statuses {
            Some(statuses) => statuses.contains(&occurrence.status),
            None => true,
        }
    }
}

/// What a history row records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Assigned,
    Accepted,
    Refused,
    Concluded,
    Canceled,
    OutcomeRegistered,
}

impl HistoryAction {
    /// Label for a transition into `target`
    pub fn for_target(target: OccurrenceStatus) -> Self {
        match target {
            OccurrenceStatus::Pending => HistoryAction::Created,
            OccurrenceStatus::InProgress => HistoryAction::Assigned,
            OccurrenceStatus::Accepted => HistoryAction::Accepted,
            OccurrenceStatus::Refused => HistoryAction::Refused,
            OccurrenceStatus::Concluded => HistoryAction::Concluded,
            OccurrenceStatus::Canceled => HistoryAction::Canceled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HistoryAction::Created => "created",
            HistoryAction::Assigned => "assigned",
            HistoryAction::Accepted => "accepted",
            HistoryAction::Refused => "refused",
            HistoryAction::Concluded => "concluded",
            HistoryAction::Canceled => "canceled",
            HistoryAction::OutcomeRegistered => "outcome_registered",
        }
    }
}

impl FromStr for HistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(HistoryAction::Created),
            "assigned" => Ok(HistoryAction::Assigned),
            "accepted" => Ok(HistoryAction::Accepted),
            "refused" => Ok(HistoryAction::Refused),
            "concluded" => Ok(HistoryAction::Concluded),
            "canceled" => Ok(HistoryAction::Canceled),
            "outcome_registered" => Ok(HistoryAction::OutcomeRegistered),
            other => Err(format!("unknown history action: {other}")),
        }
    }
}

/// Append-only trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccurrenceHistory {
    pub id: Uuid,
    pub occurrence_id: Uuid,
    pub actor: Option<Uuid>,
    pub action: HistoryAction,
    pub previous_status: Option<OccurrenceStatus>,
    pub next_status: Option<OccurrenceStatus>,
    pub outcome: Option<OutcomeType>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OccurrenceHistory {
    pub fn created(occurrence: &Occurrence) -> Self {
        Self {
            id: Uuid::now_v7(),
            occurrence_id: occurrence.id,
            actor: None,
            action: HistoryAction::Created,
            previous_status: None,
            next_status: Some(OccurrenceStatus::Pending),
            outcome: None,
            notes: None,
            created_at: occurrence.created_at,
        }
    }

    pub fn transition(
        occurrence_id: Uuid,
        actor: Option<Uuid>,
        previous: OccurrenceStatus,
        next: OccurrenceStatus,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            occurrence_id,
            actor,
            action: HistoryAction::for_target(next),
            previous_status: Some(previous),
            next_status: Some(next),
            outcome: None,
            notes,
            created_at: at,
        }
    }

    pub fn outcome(
        occurrence_id: Uuid,
        actor: Option<Uuid>,
        status: OccurrenceStatus,
        outcome: OutcomeType,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            occurrence_id,
            actor,
            action: HistoryAction::OutcomeRegistered,
            previous_status: Some(status),
            next_status: Some(status),
            outcome: Some(outcome),
            notes,
            created_at: at,
        }
    }
}

/// LGPD masking: every word keeps its first two characters, the rest become `*`.
/// One-letter words are kept; two-letter words keep the first letter only.
pub fn mask_name(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let len = word.chars().count();
            match len {
                0 | 1 => word.to_string(),
                2 => word.chars().take(1).chain(std::iter::once('*')).collect(),
                _ => word
                    .chars()
                    .take(2)
                    .chain(std::iter::repeat('*').take(len - 2))
                    .collect(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn patient() -> PatientRecord {
        PatientRecord {
            name: "Maria da Silva".to_string(),
            birth_date: None,
            age: Some(54),
            cause_of_death: "Trauma".to_string(),
            sector: Some("UTI".to_string()),
            bed: None,
            medical_record: None,
            hospital_name: None,
            unknown_identity: false,
            detected_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        }
    }

    fn occurrence(death_at: DateTime<Utc>) -> Occurrence {
        Occurrence::new(
            Uuid::nil(),
            "evt-1",
            Uuid::now_v7(),
            90,
            patient(),
            death_at,
            6,
            death_at,
        )
    }

    #[test]
    fn test_transition_table() {
        use OccurrenceStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Canceled));
        assert!(!Pending.can_transition_to(Accepted));
        assert!(InProgress.can_transition_to(Refused));
        assert!(Accepted.can_transition_to(Concluded));
        assert!(Refused.can_transition_to(Canceled));
        assert!(!Refused.can_transition_to(Accepted));
        assert!(Concluded.allowed_targets().is_empty());
        assert!(Canceled.allowed_targets().is_empty());
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = OccurrenceStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![OccurrenceStatus::Concluded, OccurrenceStatus::Canceled]
        );
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "in_progress".parse::<OccurrenceStatus>().unwrap(),
            OccurrenceStatus::InProgress
        );
        assert_eq!(
            "CANCELED".parse::<OccurrenceStatus>().unwrap(),
            OccurrenceStatus::Canceled
        );
        assert!("DONE".parse::<OccurrenceStatus>().is_err());
    }

    #[test]
    fn test_status_serde_uses_screaming_case() {
        let json = serde_json::to_string(&OccurrenceStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn test_outcome_parse() {
        assert_eq!(
            "family-refused".parse::<OutcomeType>().unwrap(),
            OutcomeType::FamilyRefused
        );
        assert!("maybe".parse::<OutcomeType>().is_err());
    }

    #[test]
    fn test_window_fixed_at_creation() {
        let death_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let occ = occurrence(death_at);
        assert_eq!(
            occ.window_expires_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap()
        );
        assert_eq!(occ.status, OccurrenceStatus::Pending);
        assert_eq!(occ.masked_patient_name, "Ma*** d* Si***");
    }

    #[test]
    fn test_window_deadline_caps_and_saturates() {
        let death_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(
            window_deadline(death_at, u32::MAX),
            death_at + Duration::hours(i64::from(MAX_WINDOW_HOURS))
        );

        let near_end = DateTime::<Utc>::MAX_UTC - Duration::hours(2);
        assert_eq!(window_deadline(near_end, 6), DateTime::<Utc>::MAX_UTC);

        let occ = Occurrence::new(
            Uuid::now_v7(),
            "evt-far",
            Uuid::now_v7(),
            50,
            patient(),
            near_end,
            u32::MAX,
            near_end,
        );
        assert_eq!(occ.window_expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_format_time_remaining() {
        let death_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let occ = occurrence(death_at);

        let now = death_at + Duration::minutes(58);
        assert_eq!(occ.format_time_remaining(now), "5h 2min");

        let now = death_at + Duration::minutes(315);
        assert_eq!(occ.format_time_remaining(now), "45min");

        let now = death_at + Duration::hours(7);
        assert_eq!(occ.format_time_remaining(now), "expired");
        assert_eq!(occ.time_remaining(now), Duration::zero());
    }

    #[test]
    fn test_mask_name() {
        assert_eq!(mask_name("Joao Pereira"), "Jo** Pe*****");
        assert_eq!(mask_name("A"), "A");
        assert_eq!(mask_name("de"), "d*");
        assert_eq!(mask_name("  Ana   Luz "), "An* Lu*");
        assert_eq!(mask_name(""), "");
    }

    #[test]
    fn test_filter_matches() {
        let death_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let mut occ = occurrence(death_at);

        assert!(OccurrenceFilter::for_hospital(occ.hospital_id).matches(&occ));
        assert!(!OccurrenceFilter::for_hospital(Uuid::now_v7()).matches(&occ));

        occ.status = OccurrenceStatus::Canceled;
        assert!(!OccurrenceFilter::for_hospital(occ.hospital_id)
            .active()
            .matches(&occ));
    }

    #[test]
    fn test_history_action_labels() {
        assert_eq!(
            HistoryAction::for_target(OccurrenceStatus::InProgress),
            HistoryAction::Assigned
        );
        assert_eq!(HistoryAction::OutcomeRegistered.as_str(), "outcome_registered");
        assert_eq!(
            "concluded".parse::<HistoryAction>().unwrap(),
            HistoryAction::Concluded
        );
    }
}
