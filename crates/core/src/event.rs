// Raw death events
//
// Stream messages are flat string maps. A single `data` key holding a JSON
// object with the same fields is also accepted.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::occurrence::{mask_name, window_deadline, PatientRecord};

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventOrigin {
    Manual,
    Simulated,
    ExternalFeed,
}

impl FromStr for EventOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "manual" => Ok(EventOrigin::Manual),
            "simulated" => Ok(EventOrigin::Simulated),
            "external-feed" | "external" => Ok(EventOrigin::ExternalFeed),
            other => Err(format!("unknown origin: {other}")),
        }
    }
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventOrigin::Manual => "manual",
            EventOrigin::Simulated => "simulated",
            EventOrigin::ExternalFeed => "external-feed",
        })
    }
}

/// A malformed stream message. The event is discarded, ingestion continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Immutable ingest record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDeathEvent {
    /// External id, the dedup key
    pub event_id: String,
    pub tenant_id: Option<Uuid>,
    pub hospital_id: Uuid,
    pub hospital_name: Option<String>,
    pub patient_name: String,
    pub birth_date: Option<NaiveDate>,
    /// Age reported by the source, used when no birth date is present
    pub reported_age: Option<u32>,
    pub cause_of_death: String,
    pub sector: Option<String>,
    pub bed: Option<String>,
    pub medical_record: Option<String>,
    pub unknown_identity: bool,
    pub death_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub origin: EventOrigin,
}

impl RawDeathEvent {
    /// Parse a stream message. `received_at` fills `detected_at` when absent.
    pub fn from_fields(
        fields: &HashMap<String, String>,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if let Some(data) = fields.get("data") {
            let flattened = flatten_json(data)?;
            return Self::parse(&flattened, received_at);
        }
        Self::parse(fields, received_at)
    }

    fn parse(
        fields: &HashMap<String, String>,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let get = |key: &str| {
            fields
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let event_id = get("event_id")
            .ok_or(ValidationError::MissingField("event_id"))?
            .to_string();

        let hospital_id = get("hospital_id")
            .ok_or(ValidationError::MissingField("hospital_id"))?;
        let hospital_id = Uuid::parse_str(hospital_id).map_err(|e| {
            ValidationError::InvalidField {
                field: "hospital_id",
                reason: e.to_string(),
            }
        })?;

        let tenant_id = get("tenant_id")
            .map(|v| {
                Uuid::parse_str(v).map_err(|e| ValidationError::InvalidField {
                    field: "tenant_id",
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let death_at = get("death_at").ok_or(ValidationError::MissingField("death_at"))?;
        let death_at = parse_timestamp("death_at", death_at)?;

        let detected_at = get("detected_at")
            .map(|v| parse_timestamp("detected_at", v))
            .transpose()?
            .unwrap_or(received_at);

        let cause_of_death = get("cause_of_death")
            .ok_or(ValidationError::MissingField("cause_of_death"))?
            .to_string();

        let birth_date = get("birth_date")
            .map(|v| parse_date("birth_date", v))
            .transpose()?;

        let reported_age = get("age")
            .map(|v| {
                v.parse::<u32>().map_err(|e| ValidationError::InvalidField {
                    field: "age",
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let unknown_identity = get("unknown_identity")
            .map(|v| parse_bool("unknown_identity", v))
            .transpose()?
            .unwrap_or(false);

        let origin = get("origin")
            .map(|v| {
                v.parse::<EventOrigin>()
                    .map_err(|reason| ValidationError::InvalidField {
                        field: "origin",
                        reason,
                    })
            })
            .transpose()?
            .unwrap_or(EventOrigin::ExternalFeed);

        Ok(Self {
            event_id,
            tenant_id,
            hospital_id,
            hospital_name: get("hospital_name").map(str::to_string),
            patient_name: get("patient_name").unwrap_or_default().to_string(),
            birth_date,
            reported_age,
            cause_of_death,
            sector: get("sector").map(str::to_string),
            bed: get("bed").map(str::to_string),
            medical_record: get("medical_record").map(str::to_string),
            unknown_identity,
            death_at,
            detected_at,
            origin,
        })
    }

    /// Age at death. With a birth date, subtracts one year when the birthday
    /// (by day of year) has not been reached in the death year.
    pub fn age_at_death(&self) -> Option<u32> {
        match self.birth_date {
            Some(birth) => {
                let death = self.death_at.date_naive();
                let mut years = death.year() - birth.year();
                if death.ordinal() < birth.ordinal() {
                    years -= 1;
                }
                u32::try_from(years).ok()
            }
            None => self.reported_age,
        }
    }

    /// End of the capture window
    pub fn window_expires_at(&self, window_hours: u32) -> DateTime<Utc> {
        window_deadline(self.death_at, window_hours)
    }

    /// Window time left at the moment of detection
    pub fn remaining_at_detection(&self, window_hours: u32) -> Duration {
        self.window_expires_at(window_hours) - self.detected_at
    }

    pub fn masked_name(&self) -> String {
        mask_name(&self.patient_name)
    }

    pub fn to_patient_record(&self) -> PatientRecord {
        PatientRecord {
            name: self.patient_name.clone(),
            birth_date: self.birth_date,
            age: self.age_at_death(),
            cause_of_death: self.cause_of_death.clone(),
            sector: self.sector.clone(),
            bed: self.bed.clone(),
            medical_record: self.medical_record.clone(),
            hospital_name: self.hospital_name.clone(),
            unknown_identity: self.unknown_identity,
            detected_at: self.detected_at,
        }
    }
}

fn flatten_json(data: &str) -> Result<HashMap<String, String>, ValidationError> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ValidationError::InvalidPayload(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ValidationError::InvalidPayload("data is not a JSON object".into()))?;

    Ok(object
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((key.clone(), text))
        })
        .collect())
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ValidationError::InvalidField {
            field,
            reason: e.to_string(),
        })
}

fn parse_date(field: &'static str, value: &str) -> Result<NaiveDate, ValidationError> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }
    parse_timestamp(field, value).map(|dt| dt.date_naive())
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ValidationError::InvalidField {
            field,
            reason: format!("not a boolean: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_fields() -> HashMap<String, String> {
        HashMap::from([
            ("event_id".to_string(), "evt-42".to_string()),
            (
                "hospital_id".to_string(),
                "0190a5b4-0000-7000-8000-000000000001".to_string(),
            ),
            ("patient_name".to_string(), "Jose Almeida".to_string()),
            ("death_at".to_string(), "2024-05-10T12:00:00Z".to_string()),
            ("cause_of_death".to_string(), "Trauma craniano".to_string()),
            ("sector".to_string(), "UTI".to_string()),
        ])
    }

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_parse_flat_fields() {
        let event = RawDeathEvent::from_fields(&base_fields(), received()).unwrap();
        assert_eq!(event.event_id, "evt-42");
        assert_eq!(event.cause_of_death, "Trauma craniano");
        assert_eq!(event.sector.as_deref(), Some("UTI"));
        assert_eq!(event.detected_at, received());
        assert_eq!(event.origin, EventOrigin::ExternalFeed);
        assert!(!event.unknown_identity);
        assert!(event.tenant_id.is_none());
    }

    #[test]
    fn test_missing_required_fields() {
        for field in ["event_id", "hospital_id", "death_at", "cause_of_death"] {
            let mut fields = base_fields();
            fields.remove(field);
            let err = RawDeathEvent::from_fields(&fields, received()).unwrap_err();
            assert_eq!(err, ValidationError::MissingField(field));
        }
    }

    #[test]
    fn test_blank_cause_is_missing() {
        let mut fields = base_fields();
        fields.insert("cause_of_death".into(), "   ".into());
        let err = RawDeathEvent::from_fields(&fields, received()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("cause_of_death"));
    }

    #[test]
    fn test_invalid_hospital_id() {
        let mut fields = base_fields();
        fields.insert("hospital_id".into(), "not-a-uuid".into());
        let err = RawDeathEvent::from_fields(&fields, received()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField {
                field: "hospital_id",
                ..
            }
        ));
    }

    #[test]
    fn test_parse_json_data_key() {
        let data = serde_json::json!({
            "event_id": "evt-7",
            "hospital_id": "0190a5b4-0000-7000-8000-000000000001",
            "death_at": "2024-05-10T12:00:00Z",
            "cause_of_death": "AVC",
            "unknown_identity": true,
            "age": 40,
            "origin": "manual",
            "bed": null
        });
        let fields = HashMap::from([("data".to_string(), data.to_string())]);
        let event = RawDeathEvent::from_fields(&fields, received()).unwrap();
        assert_eq!(event.event_id, "evt-7");
        assert!(event.unknown_identity);
        assert_eq!(event.reported_age, Some(40));
        assert_eq!(event.origin, EventOrigin::Manual);
        assert!(event.bed.is_none());
    }

    #[test]
    fn test_data_key_must_be_object() {
        let fields = HashMap::from([("data".to_string(), "[1,2]".to_string())]);
        assert!(matches!(
            RawDeathEvent::from_fields(&fields, received()),
            Err(ValidationError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_age_with_birthday_not_reached() {
        let mut fields = base_fields();
        fields.insert("birth_date".into(), "1950-08-20".into());
        let event = RawDeathEvent::from_fields(&fields, received()).unwrap();
        assert_eq!(event.age_at_death(), Some(73));
    }

    #[test]
    fn test_age_with_birthday_passed() {
        let mut fields = base_fields();
        fields.insert("birth_date".into(), "1950-01-02".into());
        fields.insert("age".into(), "10".into());
        let event = RawDeathEvent::from_fields(&fields, received()).unwrap();
        assert_eq!(event.age_at_death(), Some(74));
    }

    #[test]
    fn test_age_falls_back_to_reported() {
        let mut fields = base_fields();
        fields.insert("age".into(), "61".into());
        let event = RawDeathEvent::from_fields(&fields, received()).unwrap();
        assert_eq!(event.age_at_death(), Some(61));
    }

    #[test]
    fn test_window_helpers() {
        let event = RawDeathEvent::from_fields(&base_fields(), received()).unwrap();
        assert_eq!(
            event.window_expires_at(6),
            Utc.with_ymd_and_hms(2024, 5, 10, 18, 0, 0).unwrap()
        );
        assert_eq!(event.remaining_at_detection(6), Duration::minutes(330));
        assert_eq!(event.masked_name(), "Jo** Al*****");
    }
}
