// Notification model
//
// NotificationRecord is one per channel dispatch attempt. A record is terminal
// once sent or failed; a retried dispatch creates a new record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::occurrence::{Occurrence, OccurrenceStatus, OutcomeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Dashboard,
    Email,
    Sms,
    Push,
}

impl NotificationChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationChannel::Dashboard => "dashboard",
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
            NotificationChannel::Push => "push",
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dashboard" => Ok(NotificationChannel::Dashboard),
            "email" => Ok(NotificationChannel::Email),
            "sms" => Ok(NotificationChannel::Sms),
            "push" => Ok(NotificationChannel::Push),
            other => Err(format!("unknown notification channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NotificationStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!("unknown notification status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub occurrence_id: Uuid,
    /// None for the dashboard broadcast record
    pub user_id: Option<Uuid>,
    pub channel: NotificationChannel,
    pub status: NotificationStatus,
    /// Address the attempt was sent to (email, phone, device count)
    pub target: Option<String>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    pub fn pending(
        occurrence_id: Uuid,
        user_id: Option<Uuid>,
        channel: NotificationChannel,
        target: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            occurrence_id,
            user_id,
            channel,
            status: NotificationStatus::Pending,
            target,
            error: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A staff member returned by the shift lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub user_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Per-user channel opt-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPreferences {
    pub dashboard: bool,
    pub email: bool,
    pub sms: bool,
    pub push: bool,
}

impl Default for ChannelPreferences {
    fn default() -> Self {
        Self {
            dashboard: true,
            email: true,
            sms: false,
            push: true,
        }
    }
}

impl ChannelPreferences {
    pub fn allows(&self, channel: NotificationChannel) -> bool {
        match channel {
            NotificationChannel::Dashboard => self.dashboard,
            NotificationChannel::Email => self.email,
            NotificationChannel::Sms => self.sms,
            NotificationChannel::Push => self.push,
        }
    }
}

/// Signals fed into the hub by the ingestor and the lifecycle
#[derive(Debug, Clone)]
pub enum HubSignal {
    OccurrenceCreated {
        occurrence: Occurrence,
    },
    StatusChanged {
        occurrence: Occurrence,
        previous: OccurrenceStatus,
        actor: Option<Uuid>,
    },
    OutcomeRegistered {
        occurrence: Occurrence,
        outcome: OutcomeType,
        actor: Option<Uuid>,
    },
}

impl HubSignal {
    pub fn occurrence(&self) -> &Occurrence {
        match self {
            HubSignal::OccurrenceCreated { occurrence }
            | HubSignal::StatusChanged { occurrence, .. }
            | HubSignal::OutcomeRegistered { occurrence, .. } => occurrence,
        }
    }

    /// Event type tag pushed to live sessions
    pub fn event_type(&self) -> &'static str {
        match self {
            HubSignal::OccurrenceCreated { .. } => "new-occurrence",
            HubSignal::StatusChanged { .. } => "occurrence-updated",
            HubSignal::OutcomeRegistered { .. } => "outcome-registered",
        }
    }
}
