//! Urgency classification over the capture window
//!
//! Urgency is derived from `window_expires_at - now` at minute precision and is
//! recomputed on every read.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Remaining minutes below which an occurrence is RED
pub const RED_BELOW_MINUTES: i64 = 120;

/// Remaining minutes below which an occurrence is YELLOW
pub const YELLOW_BELOW_MINUTES: i64 = 240;

/// Severity tier. Ordering follows severity: `None < Green < Yellow < Red`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    /// No occurrences to classify
    None,
    Green,
    Yellow,
    Red,
}

impl Urgency {
    /// Classify an occurrence window against the current time
    pub fn classify(window_expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::from_remaining(window_expires_at - now)
    }

    /// Classify a remaining duration. Expired windows are RED.
    pub fn from_remaining(remaining: Duration) -> Self {
        let minutes = remaining.num_minutes();
        if remaining <= Duration::zero() || minutes < RED_BELOW_MINUTES {
            Urgency::Red
        } else if minutes < YELLOW_BELOW_MINUTES {
            Urgency::Yellow
        } else {
            Urgency::Green
        }
    }

    /// Most severe tier present; `None` for an empty set
    pub fn aggregate<I>(tiers: I) -> Self
    where
        I: IntoIterator<Item = Urgency>,
    {
        tiers.into_iter().max().unwrap_or(Urgency::None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::None => "NONE",
            Urgency::Green => "GREEN",
            Urgency::Yellow => "YELLOW",
            Urgency::Red => "RED",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
