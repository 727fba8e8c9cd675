//! Triage engine
//!
//! Evaluates one [`RawDeathEvent`] against an ordered [`RuleSet`]. Evaluation is
//! pure: the same event and rule snapshot always produce the same [`Verdict`].
//!
//! Matching policy:
//! - excluded causes match when the trimmed, lowercased cause contains an entry
//! - sectors match the score table by trimmed, case-insensitive exact key
//! - the time-window bonus is computed from the detection timestamp, not wall time

use chrono::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::RawDeathEvent;
use crate::rules::{Rule, RuleAction, RuleKind, RuleSet};

/// Why an event was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub rule_type: String,
    pub detail: String,
}

/// Result of triaging one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub eligible: bool,
    /// Clamped to 0..=100; zero when rejected
    pub score: u8,
    pub rejection: Option<Rejection>,
    /// Names of non-rejecting rules whose condition matched
    pub alerts: Vec<String>,
    /// Names of rules evaluated, in order
    pub rules_applied: Vec<String>,
}

impl Verdict {
    /// Identity of the rule that rejected the event
    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection.as_ref().map(|r| r.rule_name.as_str())
    }
}

/// Read-only counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageStats {
    pub running: bool,
    pub total_processed: u64,
    pub total_eligible: u64,
    pub total_ineligible: u64,
    pub error_count: u64,
}

/// Stateless evaluation plus a lock-protected stats block
#[derive(Debug, Default)]
pub struct TriageEngine {
    stats: Mutex<TriageStats>,
}

impl TriageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure evaluation. Rules run in ascending priority; the first matching
    /// reject rule ends evaluation.
    pub fn evaluate(event: &RawDeathEvent, rules: &RuleSet) -> Verdict {
        let mut score: u32 = 0;
        let mut alerts = Vec::new();
        let mut rules_applied = Vec::new();

        for rule in rules.rules() {
            rules_applied.push(rule.name.clone());

            if let RuleKind::SectorPriorityScore(table) = &rule.kind {
                score = score.saturating_add(table.score_for(event.sector.as_deref()));
                continue;
            }

            let matched = match_rule(event, rule);

            match (rule.action, matched) {
                (RuleAction::Reject, Some(detail)) => {
                    return Verdict {
                        eligible: false,
                        score: 0,
                        rejection: Some(Rejection {
                            rule_id: rule.id,
                            rule_name: rule.name.clone(),
                            rule_type: rule.kind.type_name().to_string(),
                            detail,
                        }),
                        alerts,
                        rules_applied,
                    };
                }
                (RuleAction::Reject, None) => {}
                (RuleAction::Prioritize | RuleAction::Alert, matched) => {
                    if let RuleKind::TimeWindowHours(hours) = rule.kind {
                        score = score.saturating_add(window_bonus(event, hours));
                    }
                    if matched.is_some() {
                        alerts.push(rule.name.clone());
                    }
                }
            }
        }

        Verdict {
            eligible: true,
            score: score.min(100) as u8,
            rejection: None,
            alerts,
            rules_applied,
        }
    }

    /// Evaluate and record the outcome in the stats block
    pub fn assess(&self, event: &RawDeathEvent, rules: &RuleSet) -> Verdict {
        let verdict = Self::evaluate(event, rules);
        let mut stats = self.stats.lock();
        stats.total_processed += 1;
        if verdict.eligible {
            stats.total_eligible += 1;
        } else {
            stats.total_ineligible += 1;
        }
        verdict
    }

    /// Count a malformed event as processed-but-ineligible
    pub fn record_invalid(&self) {
        let mut stats = self.stats.lock();
        stats.total_processed += 1;
        stats.total_ineligible += 1;
    }

    pub fn record_error(&self) {
        self.stats.lock().error_count += 1;
    }

    pub fn set_running(&self, running: bool) {
        self.stats.lock().running = running;
    }

    pub fn stats(&self) -> TriageStats {
        self.stats.lock().clone()
    }
}

/// Returns a human-readable detail when the rule's condition holds
fn match_rule(event: &RawDeathEvent, rule: &Rule) -> Option<String> {
    match &rule.kind {
        RuleKind::MaxAge(limit) => {
            let age = event.age_at_death()?;
            (age > *limit).then(|| format!("age {age} exceeds limit {limit}"))
        }
        RuleKind::ExcludedCauses(causes) => {
            let cause = event.cause_of_death.trim().to_lowercase();
            causes
                .iter()
                .find(|excluded| cause.contains(excluded.as_str()))
                .map(|excluded| format!("cause of death matches excluded entry '{excluded}'"))
        }
        RuleKind::TimeWindowHours(hours) => {
            let deadline = event.window_expires_at(*hours);
            (event.detected_at >= deadline)
                .then(|| format!("detected after the {hours}h capture window closed"))
        }
        RuleKind::UnknownIdentityReject(enabled) => (*enabled && event.unknown_identity)
            .then(|| "patient identity unknown".to_string()),
        RuleKind::SectorPriorityScore(_) => None,
    }
}

/// Bonus for little window left at detection: <=1h +20, <=2h +10, <=3h +5
fn window_bonus(event: &RawDeathEvent, hours: u32) -> u32 {
    let remaining = event.remaining_at_detection(hours);
    if remaining <= Duration::zero() {
        0
    } else if remaining <= Duration::hours(1) {
        20
    } else if remaining <= Duration::hours(2) {
        10
    } else if remaining <= Duration::hours(3) {
        5
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventOrigin;
    use crate::rules::SectorScores;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    fn event() -> RawDeathEvent {
        let death_at = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        RawDeathEvent {
            event_id: "evt-1".into(),
            tenant_id: None,
            hospital_id: Uuid::now_v7(),
            hospital_name: None,
            patient_name: "Carlos Souza".into(),
            birth_date: Some(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
            reported_age: None,
            cause_of_death: "Politraumatismo".into(),
            sector: Some("ICU".into()),
            bed: None,
            medical_record: None,
            unknown_identity: false,
            death_at,
            detected_at: death_at + Duration::minutes(10),
            origin: EventOrigin::ExternalFeed,
        }
    }

    fn sector_rule() -> Rule {
        Rule::new(
            "sector",
            50,
            RuleAction::Prioritize,
            RuleKind::SectorPriorityScore(SectorScores::new([("ICU", 100), ("Ward", 30)], 40)),
        )
    }

    #[test]
    fn test_icu_scores_100() {
        let rules = RuleSet::new(vec![
            Rule::new("age", 1, RuleAction::Reject, RuleKind::MaxAge(75)),
            sector_rule(),
        ]);
        let verdict = TriageEngine::evaluate(&event(), &rules);
        assert!(verdict.eligible);
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.rules_applied, vec!["age", "sector"]);
    }

    #[test]
    fn test_max_age_rejects_82() {
        let mut e = event();
        e.birth_date = Some(NaiveDate::from_ymd_opt(1942, 1, 1).unwrap());
        let rules = RuleSet::new(vec![
            Rule::new("Max age 75", 1, RuleAction::Reject, RuleKind::MaxAge(75)),
            sector_rule(),
        ]);
        let verdict = TriageEngine::evaluate(&e, &rules);
        assert!(!verdict.eligible);
        assert_eq!(verdict.score, 0);
        assert_eq!(verdict.rejection_reason(), Some("Max age 75"));
        // short-circuit: sector rule never evaluated
        assert_eq!(verdict.rules_applied, vec!["Max age 75"]);
    }

    #[test]
    fn test_age_at_limit_passes() {
        let mut e = event();
        e.birth_date = None;
        e.reported_age = Some(75);
        let rules = RuleSet::new(vec![Rule::new(
            "age",
            1,
            RuleAction::Reject,
            RuleKind::MaxAge(75),
        )]);
        assert!(TriageEngine::evaluate(&e, &rules).eligible);
    }

    #[test]
    fn test_excluded_cause_substring_case_insensitive() {
        let mut e = event();
        e.cause_of_death = "Choque SEPTICO grave".into();
        let rules = RuleSet::new(vec![Rule::new(
            "causes",
            1,
            RuleAction::Reject,
            RuleKind::ExcludedCauses(vec!["septico".into()]),
        )]);
        let verdict = TriageEngine::evaluate(&e, &rules);
        assert!(!verdict.eligible);
        assert_eq!(verdict.rejection.unwrap().rule_type, "excluded-causes");
    }

    #[test]
    fn test_time_window_rejects_late_detection() {
        let mut e = event();
        e.detected_at = e.death_at + Duration::hours(6);
        let rules = RuleSet::new(vec![Rule::new(
            "window",
            1,
            RuleAction::Reject,
            RuleKind::TimeWindowHours(6),
        )]);
        assert!(!TriageEngine::evaluate(&e, &rules).eligible);

        e.detected_at = e.death_at + Duration::hours(5);
        assert!(TriageEngine::evaluate(&e, &rules).eligible);
    }

    #[test]
    fn test_huge_window_does_not_overflow() {
        let rules = RuleSet::new(vec![Rule::new(
            "window",
            1,
            RuleAction::Reject,
            RuleKind::TimeWindowHours(u32::MAX),
        )]);
        let verdict = TriageEngine::evaluate(&event(), &rules);
        assert!(verdict.eligible);

        let mut late = event();
        late.death_at = DateTime::<Utc>::MAX_UTC - Duration::hours(1);
        late.detected_at = late.death_at;
        assert!(TriageEngine::evaluate(&late, &rules).eligible);
    }

    #[test]
    fn test_unknown_identity() {
        let mut e = event();
        e.unknown_identity = true;
        let enabled = RuleSet::new(vec![Rule::new(
            "unknown",
            1,
            RuleAction::Reject,
            RuleKind::UnknownIdentityReject(true),
        )]);
        let disabled = RuleSet::new(vec![Rule::new(
            "unknown",
            1,
            RuleAction::Reject,
            RuleKind::UnknownIdentityReject(false),
        )]);
        assert!(!TriageEngine::evaluate(&e, &enabled).eligible);
        assert!(TriageEngine::evaluate(&e, &disabled).eligible);
    }

    #[test]
    fn test_priority_order_decides_reason() {
        let mut e = event();
        e.unknown_identity = true;
        e.reported_age = Some(90);
        e.birth_date = None;
        let rules = RuleSet::new(vec![
            Rule::new("age", 5, RuleAction::Reject, RuleKind::MaxAge(80)),
            Rule::new(
                "unknown",
                2,
                RuleAction::Reject,
                RuleKind::UnknownIdentityReject(true),
            ),
        ]);
        let verdict = TriageEngine::evaluate(&e, &rules);
        assert_eq!(verdict.rejection_reason(), Some("unknown"));
    }

    #[test]
    fn test_window_bonus_and_clamp() {
        let mut e = event();
        e.sector = Some("Ward".into());
        e.detected_at = e.death_at + Duration::minutes(5 * 60 + 30);
        let rules = RuleSet::new(vec![
            Rule::new(
                "window bonus",
                1,
                RuleAction::Prioritize,
                RuleKind::TimeWindowHours(6),
            ),
            sector_rule(),
        ]);
        let verdict = TriageEngine::evaluate(&e, &rules);
        assert_eq!(verdict.score, 50);

        e.sector = Some("ICU".into());
        assert_eq!(TriageEngine::evaluate(&e, &rules).score, 100);
    }

    #[test]
    fn test_non_reject_match_becomes_alert() {
        let mut e = event();
        e.unknown_identity = true;
        let rules = RuleSet::new(vec![
            Rule::new(
                "flag unknown",
                1,
                RuleAction::Alert,
                RuleKind::UnknownIdentityReject(true),
            ),
            sector_rule(),
        ]);
        let verdict = TriageEngine::evaluate(&e, &rules);
        assert!(verdict.eligible);
        assert_eq!(verdict.alerts, vec!["flag unknown"]);
    }

    #[test]
    fn test_unlisted_sector_uses_fallback() {
        let mut e = event();
        e.sector = None;
        let rules = RuleSet::new(vec![sector_rule()]);
        assert_eq!(TriageEngine::evaluate(&e, &rules).score, 40);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let rules = RuleSet::builtin_default();
        let e = event();
        let first = TriageEngine::evaluate(&e, &rules);
        for _ in 0..10 {
            assert_eq!(TriageEngine::evaluate(&e, &rules), first);
        }
    }

    #[test]
    fn test_stats_counters() {
        let engine = TriageEngine::new();
        engine.set_running(true);
        let rules = RuleSet::new(vec![Rule::new(
            "age",
            1,
            RuleAction::Reject,
            RuleKind::MaxAge(30),
        )]);
        let mut young = event();
        young.birth_date = None;
        young.reported_age = Some(20);
        engine.assess(&young, &rules);
        engine.assess(&event(), &rules);
        engine.record_invalid();
        engine.record_error();

        let stats = engine.stats();
        assert!(stats.running);
        assert_eq!(stats.total_processed, 3);
        assert_eq!(stats.total_eligible, 1);
        assert_eq!(stats.total_ineligible, 2);
        assert_eq!(stats.error_count, 1);
    }
}
