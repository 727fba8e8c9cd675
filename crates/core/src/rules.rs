//! Triage rules
//!
//! Rule rows arrive from the rule provider as `{type, value, action}` JSON blobs.
//! They are decoded once into [`RuleKind`] when a [`RuleSet`] is loaded, so
//! evaluation never touches JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::occurrence::MAX_WINDOW_HOURS;

/// Fallback score for sectors missing from the table
pub const DEFAULT_SECTOR_FALLBACK: u32 = 40;

/// What a matching rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Reject,
    Prioritize,
    Alert,
}

/// Sector score table with a fallback for unlisted sectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorScores {
    /// Keys are stored trimmed and lowercased
    pub scores: BTreeMap<String, u32>,
    pub fallback: u32,
}

impl SectorScores {
    pub fn new<I, S>(entries: I, fallback: u32) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: AsRef<str>,
    {
        Self {
            scores: entries
                .into_iter()
                .map(|(sector, score)| (normalize_sector(sector.as_ref()), score))
                .collect(),
            fallback,
        }
    }

    /// Case-insensitive, trimmed exact lookup
    pub fn score_for(&self, sector: Option<&str>) -> u32 {
        sector
            .and_then(|s| self.scores.get(&normalize_sector(s)))
            .copied()
            .unwrap_or(self.fallback)
    }
}

fn normalize_sector(sector: &str) -> String {
    sector.trim().to_lowercase()
}

/// Closed set of rule kinds with typed parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum RuleKind {
    /// Matches when age at death exceeds the limit
    MaxAge(u32),
    /// Matches when the cause contains any entry (case-insensitive)
    ExcludedCauses(Vec<String>),
    /// Matches when detection happened after the window closed
    TimeWindowHours(u32),
    /// Matches unidentified patients when enabled
    UnknownIdentityReject(bool),
    /// Never matches; contributes a sector score
    SectorPriorityScore(SectorScores),
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::MaxAge(_) => "max-age",
            RuleKind::ExcludedCauses(_) => "excluded-causes",
            RuleKind::TimeWindowHours(_) => "time-window-hours",
            RuleKind::UnknownIdentityReject(_) => "unknown-identity-reject",
            RuleKind::SectorPriorityScore(_) => "sector-priority-score",
        }
    }
}

/// Row shape returned by the rule provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub active: bool,
    pub config: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum RuleDecodeError {
    #[error("rule {name}: unknown rule type {rule_type}")]
    UnknownType { name: String, rule_type: String },

    #[error("rule {name}: invalid {field}: {reason}")]
    InvalidConfig {
        name: String,
        field: &'static str,
        reason: String,
    },
}

#[derive(Deserialize)]
struct RawRuleConfig {
    #[serde(rename = "type")]
    rule_type: String,
    #[serde(default)]
    value: serde_json::Value,
    action: RuleAction,
}

#[derive(Deserialize)]
struct RawSectorTable {
    scores: BTreeMap<String, f64>,
    #[serde(default)]
    fallback: Option<f64>,
}

/// A decoded, active rule
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub action: RuleAction,
    pub kind: RuleKind,
}

impl Rule {
    pub fn new(name: impl Into<String>, priority: i32, action: RuleAction, kind: RuleKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            priority,
            action,
            kind,
        }
    }

    /// Decode a provider row. Inactive rows are not filtered here.
    pub fn decode(def: &RuleDefinition) -> Result<Self, RuleDecodeError> {
        let invalid = |field: &'static str, reason: String| RuleDecodeError::InvalidConfig {
            name: def.name.clone(),
            field,
            reason,
        };

        let raw: RawRuleConfig =
            serde_json::from_value(def.config.clone()).map_err(|e| invalid("config", e.to_string()))?;

        let kind = match raw.rule_type.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "max-age" => RuleKind::MaxAge(non_negative(&raw.value).map_err(|r| invalid("value", r))?),
            "excluded-causes" => {
                let causes: Vec<String> = serde_json::from_value(raw.value)
                    .map_err(|e| invalid("value", e.to_string()))?;
                RuleKind::ExcludedCauses(
                    causes
                        .into_iter()
                        .map(|c| c.trim().to_lowercase())
                        .filter(|c| !c.is_empty())
                        .collect(),
                )
            }
            "time-window-hours" => {
                let hours = non_negative(&raw.value).map_err(|r| invalid("value", r))?;
                if hours > MAX_WINDOW_HOURS {
                    return Err(invalid(
                        "value",
                        format!("window of {hours}h exceeds the {MAX_WINDOW_HOURS}h limit"),
                    ));
                }
                RuleKind::TimeWindowHours(hours)
            }
            "unknown-identity-reject" => RuleKind::UnknownIdentityReject(
                raw.value
                    .as_bool()
                    .ok_or_else(|| invalid("value", "expected a boolean".into()))?,
            ),
            "sector-priority-score" => {
                RuleKind::SectorPriorityScore(decode_sector_table(raw.value).map_err(|r| invalid("value", r))?)
            }
            other => {
                return Err(RuleDecodeError::UnknownType {
                    name: def.name.clone(),
                    rule_type: other.to_string(),
                })
            }
        };

        Ok(Self {
            id: def.id,
            name: def.name.clone(),
            priority: def.priority,
            action: raw.action,
            kind,
        })
    }
}

fn non_negative(value: &serde_json::Value) -> Result<u32, String> {
    let n = value
        .as_f64()
        .ok_or_else(|| format!("expected a number, got {value}"))?;
    if n < 0.0 || !n.is_finite() {
        return Err(format!("expected a non-negative number, got {n}"));
    }
    Ok(n.floor().min(f64::from(u32::MAX)) as u32)
}

fn score(n: f64) -> u32 {
    n.clamp(0.0, 100.0) as u32
}

// Accepts either {"scores": {...}, "fallback": n} or a bare sector map.
fn decode_sector_table(value: serde_json::Value) -> Result<SectorScores, String> {
    if value.get("scores").is_some() {
        let table: RawSectorTable = serde_json::from_value(value).map_err(|e| e.to_string())?;
        return Ok(SectorScores::new(
            table.scores.into_iter().map(|(k, v)| (k, score(v))),
            table.fallback.map(score).unwrap_or(DEFAULT_SECTOR_FALLBACK),
        ));
    }
    let table: BTreeMap<String, f64> = serde_json::from_value(value).map_err(|e| e.to_string())?;
    Ok(SectorScores::new(
        table.into_iter().map(|(k, v)| (k, score(v))),
        DEFAULT_SECTOR_FALLBACK,
    ))
}

/// Ordered, immutable rule list (ascending priority, stable on ties)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self { rules }
    }

    /// Decode provider rows, skipping inactive and undecodable ones
    pub fn from_definitions(definitions: &[RuleDefinition]) -> Self {
        let rules = definitions
            .iter()
            .filter(|def| def.active)
            .filter_map(|def| match Rule::decode(def) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(rule_id = %def.id, error = %e, "Skipping undecodable triage rule");
                    None
                }
            })
            .collect();
        Self::new(rules)
    }

    /// Rules used when a tenant has nothing configured or the provider is down
    pub fn builtin_default() -> Self {
        Self::new(vec![
            Rule::new("Idade maxima", 1, RuleAction::Reject, RuleKind::MaxAge(80)),
            Rule::new(
                "Janela de captacao",
                2,
                RuleAction::Reject,
                RuleKind::TimeWindowHours(6),
            ),
            Rule::new(
                "Identificacao desconhecida",
                3,
                RuleAction::Reject,
                RuleKind::UnknownIdentityReject(true),
            ),
            Rule::new(
                "Prioridade por setor",
                10,
                RuleAction::Prioritize,
                RuleKind::SectorPriorityScore(SectorScores::new(
                    [
                        ("UTI", 100),
                        ("Emergencia", 80),
                        ("Centro Cirurgico", 70),
                        ("Enfermaria", 50),
                    ],
                    DEFAULT_SECTOR_FALLBACK,
                )),
            ),
        ])
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self
            .rules
            .iter()
            .map(|r| format!("{}:{}", r.priority, r.kind.type_name()))
            .collect();
        write!(f, "[{}]", names.join(", "))
    }
}
