// Per-channel notification dispatch
//
// For a new occurrence: one dashboard record for the live broadcast, then one
// record per (on-duty operator, enabled channel). Every record ends sent or
// failed; an unconfigured channel fails instead of silently succeeding.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use vigil_core::{
    ChannelPreferences, NotificationChannel, NotificationRecord, NotificationStatus,
    NotificationStore, Occurrence, OccurrenceStore, Operator, PreferenceDirectory, ShiftDirectory,
};

use crate::senders::{OutboundMessage, SendError, SenderMap};

const EXTERNAL_CHANNELS: [NotificationChannel; 3] = [
    NotificationChannel::Email,
    NotificationChannel::Sms,
    NotificationChannel::Push,
];

/// Outcome counts for one occurrence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub operators: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    pub sent: u64,
    pub failed: u64,
}

pub struct Dispatcher {
    shifts: Arc<dyn ShiftDirectory>,
    preferences: Arc<dyn PreferenceDirectory>,
    records: Arc<dyn NotificationStore>,
    occurrences: Arc<dyn OccurrenceStore>,
    senders: SenderMap,
    send_timeout: Duration,
    dashboard_url: Option<String>,
    counters: Mutex<DispatchCounters>,
}

impl Dispatcher {
    pub fn new(
        shifts: Arc<dyn ShiftDirectory>,
        preferences: Arc<dyn PreferenceDirectory>,
        records: Arc<dyn NotificationStore>,
        occurrences: Arc<dyn OccurrenceStore>,
        senders: SenderMap,
    ) -> Self {
        Self {
            shifts,
            preferences,
            records,
            occurrences,
            senders,
            send_timeout: Duration::from_secs(10),
            dashboard_url: None,
            counters: Mutex::new(DispatchCounters::default()),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_dashboard_url(mut self, url: Option<String>) -> Self {
        self.dashboard_url = url;
        self
    }

    pub fn counters(&self) -> DispatchCounters {
        *self.counters.lock()
    }

    /// Staff on shift when the death happened, else the hospital's managers
    async fn recipients(&self, occurrence: &Occurrence) -> Vec<Operator> {
        let hospital_id = occurrence.hospital_id;
        match self.shifts.on_duty(hospital_id, occurrence.death_at).await {
            Ok(operators) if !operators.is_empty() => return operators,
            Ok(_) => debug!("Nobody on shift, falling back to managers"),
            Err(e) => warn!(error = %e, "Shift lookup failed, falling back to managers"),
        }
        match self.shifts.fallback_managers(hospital_id).await {
            Ok(managers) => {
                if managers.is_empty() {
                    warn!("No active managers for hospital, only the dashboard was notified");
                }
                managers
            }
            Err(e) => {
                warn!(error = %e, "Manager lookup failed, only the dashboard was notified");
                Vec::new()
            }
        }
    }

    /// Notify everyone on duty about a new occurrence
    #[instrument(skip(self, occurrence), fields(occurrence_id = %occurrence.id, hospital_id = %occurrence.hospital_id))]
    pub async fn dispatch_new(&self, occurrence: &Occurrence, sessions_reached: usize) -> DispatchReport {
        let mut report = DispatchReport::default();

        let dashboard = NotificationRecord::pending(
            occurrence.id,
            None,
            NotificationChannel::Dashboard,
            None,
        )
        .with_metadata(json!({ "sessions": sessions_reached }));
        self.finish(&dashboard, Ok(()), &mut report).await;

        let operators = self.recipients(occurrence).await;
        report.operators = operators.len();

        let message = self.compose(occurrence);
        for operator in &operators {
            let preferences = match self.preferences.preferences(operator.user_id).await {
                Ok(preferences) => preferences,
                Err(e) => {
                    warn!(user_id = %operator.user_id, error = %e, "Preference lookup failed, using defaults");
                    ChannelPreferences::default()
                }
            };
            for channel in EXTERNAL_CHANNELS {
                if !preferences.allows(channel) {
                    continue;
                }
                let targets = self.targets_for(operator, channel).await;
                if targets.is_empty() {
                    debug!(user_id = %operator.user_id, %channel, "No target for channel");
                    report.skipped += 1;
                    continue;
                }
                let record = NotificationRecord::pending(
                    occurrence.id,
                    Some(operator.user_id),
                    channel,
                    Some(describe_targets(channel, &targets)),
                );
                if let Err(e) = self.records.create(&record).await {
                    warn!(user_id = %operator.user_id, %channel, error = %e, "Failed to record notification");
                    continue;
                }
                let result = self.deliver(channel, &targets, &message).await;
                self.complete(&record, result, &mut report).await;
            }
        }

        if let Err(e) = self.occurrences.mark_notified(occurrence.id, Utc::now()).await {
            warn!(error = %e, "Failed to mark occurrence notified");
        }

        info!(
            operators = report.operators,
            sent = report.sent,
            failed = report.failed,
            "Dispatch finished"
        );
        report
    }

    async fn deliver(
        &self,
        channel: NotificationChannel,
        targets: &[String],
        message: &OutboundMessage,
    ) -> Result<(), SendError> {
        let sender = self
            .senders
            .get(&channel)
            .ok_or(SendError::NotConfigured(channel))?;
        match tokio::time::timeout(self.send_timeout, sender.send(targets, message)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Create and immediately complete a record (dashboard path)
    async fn finish(
        &self,
        record: &NotificationRecord,
        result: Result<(), SendError>,
        report: &mut DispatchReport,
    ) {
        if let Err(e) = self.records.create(record).await {
            warn!(channel = %record.channel, error = %e, "Failed to record notification");
            return;
        }
        self.complete(record, result, report).await;
    }

    async fn complete(
        &self,
        record: &NotificationRecord,
        result: Result<(), SendError>,
        report: &mut DispatchReport,
    ) {
        let (status, error) = match result {
            Ok(()) => (NotificationStatus::Sent, None),
            Err(e) => {
                warn!(channel = %record.channel, user_id = ?record.user_id, error = %e, "Notification failed");
                (NotificationStatus::Failed, Some(e.to_string()))
            }
        };
        {
            let mut counters = self.counters.lock();
            match status {
                NotificationStatus::Sent => {
                    report.sent += 1;
                    counters.sent += 1;
                }
                _ => {
                    report.failed += 1;
                    counters.failed += 1;
                }
            }
        }
        if let Err(e) = self.records.complete(record.id, status, error, Utc::now()).await {
            warn!(record_id = %record.id, error = %e, "Failed to complete notification record");
        }
    }

    async fn targets_for(&self, operator: &Operator, channel: NotificationChannel) -> Vec<String> {
        match channel {
            NotificationChannel::Email => operator.email.iter().cloned().collect(),
            NotificationChannel::Sms => operator.phone.iter().cloned().collect(),
            NotificationChannel::Push => match self.preferences.push_tokens(operator.user_id).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!(user_id = %operator.user_id, error = %e, "Push token lookup failed");
                    Vec::new()
                }
            },
            NotificationChannel::Dashboard => Vec::new(),
        }
    }

    fn compose(&self, occurrence: &Occurrence) -> OutboundMessage {
        let now = Utc::now();
        let urgency = occurrence.urgency(now);
        let hospital = occurrence
            .patient
            .hospital_name
            .clone()
            .unwrap_or_else(|| occurrence.hospital_id.to_string());
        let sector = occurrence.sector().unwrap_or("unknown sector");
        OutboundMessage {
            occurrence_id: occurrence.id,
            hospital_id: occurrence.hospital_id,
            subject: format!("[{}] New eligible occurrence at {}", urgency.as_str().to_uppercase(), hospital),
            body: format!(
                "Patient {} in {}. Capture window: {} remaining (score {}).",
                occurrence.masked_patient_name,
                sector,
                occurrence.format_time_remaining(now),
                occurrence.priority_score
            ),
            urgency,
            link: self
                .dashboard_url
                .as_ref()
                .map(|base| format!("{}/occurrences/{}", base.trim_end_matches('/'), occurrence.id)),
        }
    }
}

fn describe_targets(channel: NotificationChannel, targets: &[String]) -> String {
    match channel {
        NotificationChannel::Push => format!("{} device(s)", targets.len()),
        _ => targets.join(","),
    }
}
