// Event ingestor
//
// Long-running consumer: read a batch, validate, dedup, triage, open the
// occurrence, then ack. Invalid, duplicate and ineligible messages are acked
// because retrying them cannot change the result. Messages whose store write
// keeps failing are marked failed and kept for inspection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use vigil_core::{
    Occurrence, OccurrenceLifecycle, OccurrenceStore, RawDeathEvent, StoreError, TriageEngine,
    ValidationError,
};

use crate::config::PipelineConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::rules_cache::RuleSetCache;
use crate::stream::{EventStream, StreamError, StreamMessage};

/// Grace added on top of the stream's own read timeout
const READ_GRACE: Duration = Duration::from_secs(5);
const ERROR_BACKOFF_MIN: Duration = Duration::from_secs(1);

/// What happened to one message
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Created(Uuid),
    Duplicate,
    Invalid(ValidationError),
    Ineligible(String),
    Failed(String),
}

impl Disposition {
    fn should_ack(&self) -> bool {
        !matches!(self, Disposition::Failed(_))
    }
}

/// Ingestor health snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestorStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Occurrences opened since midnight UTC
    pub detected_today: u64,
    pub total_processed: u64,
    pub error_count: u64,
}

#[derive(Default)]
struct StatusState {
    status: IngestorStatus,
    day: Option<NaiveDate>,
}

impl StatusState {
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.status.detected_today = 0;
        }
    }
}

pub struct EventIngestor {
    stream: Arc<dyn EventStream>,
    occurrences: Arc<dyn OccurrenceStore>,
    lifecycle: Arc<OccurrenceLifecycle>,
    rules: Arc<RuleSetCache>,
    engine: Arc<TriageEngine>,
    config: PipelineConfig,
    retry: RetryPolicy,
    state: Mutex<StatusState>,
}

/// Clears the running flags when `run` exits, including by unwinding
struct RunningGuard<'a>(&'a EventIngestor);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().status.running = false;
        self.0.engine.set_running(false);
    }
}

impl EventIngestor {
    pub fn new(
        stream: Arc<dyn EventStream>,
        occurrences: Arc<dyn OccurrenceStore>,
        lifecycle: Arc<OccurrenceLifecycle>,
        rules: Arc<RuleSetCache>,
        engine: Arc<TriageEngine>,
        config: PipelineConfig,
    ) -> Self {
        let retry = RetryPolicy::exponential().with_max_attempts(config.store_max_attempts.max(1));
        Self {
            stream,
            occurrences,
            lifecycle,
            rules,
            engine,
            config,
            retry,
            state: Mutex::new(StatusState::default()),
        }
    }

    /// Override the store-write retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn status(&self) -> IngestorStatus {
        let mut state = self.state.lock();
        state.roll_day(Utc::now());
        state.status.clone()
    }

    /// Consume the stream until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        {
            let mut state = self.state.lock();
            state.status.running = true;
            state.status.started_at = Some(Utc::now());
        }
        self.engine.set_running(true);
        let _running = RunningGuard(self);
        info!(
            batch_size = self.config.batch_size,
            window_hours = self.config.window_hours,
            "Event ingestor started"
        );

        let mut idle = Backoff::new(self.config.idle_backoff_min, self.config.idle_backoff_max);
        let mut errors = Backoff::new(
            ERROR_BACKOFF_MIN.min(self.config.error_backoff_max),
            self.config.error_backoff_max,
        );

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.read_batch() => read,
            };

            let delay = match read {
                Ok(batch) if batch.is_empty() => {
                    errors.reset();
                    idle.next_delay()
                }
                Ok(batch) => {
                    idle.reset();
                    errors.reset();
                    debug!(count = batch.len(), "Processing batch");
                    for message in batch {
                        // Finish the batch in hand; cancellation is checked between reads
                        self.process_message(message).await;
                    }
                    continue;
                }
                Err(e) => {
                    self.count_error();
                    let delay = errors.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Stream read failed");
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Event ingestor stopped");
    }

    async fn read_batch(&self) -> Result<Vec<StreamMessage>, StreamError> {
        let limit = self.config.read_timeout + READ_GRACE;
        match tokio::time::timeout(
            limit,
            self.stream.read(self.config.batch_size, self.config.read_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StreamError::Unavailable("read timed out".into())),
        }
    }

    /// Handle one stream message end to end, including ack or fail
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn process_message(&self, message: StreamMessage) -> Disposition {
        let disposition = match RawDeathEvent::from_fields(&message.fields, Utc::now()) {
            Ok(event) => self.process_event(&event).await,
            Err(e) => {
                warn!(error = %e, "Discarding invalid death event");
                self.engine.record_invalid();
                Disposition::Invalid(e)
            }
        };
        self.touch_processed();

        let settled = if disposition.should_ack() {
            self.stream.ack(&message.id).await
        } else {
            let reason = match &disposition {
                Disposition::Failed(reason) => reason.as_str(),
                _ => "unknown",
            };
            self.stream.fail(&message.id, reason).await
        };
        if let Err(e) = settled {
            // Unsettled messages are redelivered; dedup absorbs the repeat
            warn!(error = %e, "Failed to settle stream message");
        }
        disposition
    }

    /// Dedup, triage and open an occurrence for a parsed event
    #[instrument(skip(self, event), fields(event_id = %event.event_id, hospital_id = %event.hospital_id))]
    pub async fn process_event(&self, event: &RawDeathEvent) -> Disposition {
        match self.already_opened(event).await {
            Ok(true) => {
                debug!("Event already has an occurrence, skipping");
                return Disposition::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                self.count_error();
                self.engine.record_error();
                error!(error = %e, "Dedup lookup failed");
                return Disposition::Failed(e.to_string());
            }
        }

        let tenant_id = event.tenant_id.unwrap_or(self.config.default_tenant_id);
        let rules = self.rules.get(tenant_id).await;
        let verdict = self.engine.assess(event, &rules);
        if !verdict.eligible {
            let reason = verdict
                .rejection_reason()
                .unwrap_or("ineligible")
                .to_string();
            info!(patient = %event.masked_name(), reason = %reason, "Event not eligible");
            return Disposition::Ineligible(reason);
        }

        let occurrence = Occurrence::new(
            tenant_id,
            event.event_id.clone(),
            event.hospital_id,
            verdict.score,
            event.to_patient_record(),
            event.death_at,
            self.config.window_hours,
            Utc::now(),
        );
        if !verdict.alerts.is_empty() {
            debug!(alerts = ?verdict.alerts, "Triage alerts");
        }

        let mut attempt = 1;
        loop {
            match self.lifecycle.open(occurrence.clone()).await {
                Ok(opened) => {
                    self.count_detected();
                    info!(
                        occurrence_id = %opened.id,
                        score = opened.priority_score,
                        patient = %opened.masked_patient_name,
                        time_remaining = %opened.format_time_remaining(Utc::now()),
                        "Occurrence opened"
                    );
                    return Disposition::Created(opened.id);
                }
                Err(StoreError::DuplicateOccurrence { .. }) => {
                    debug!("Concurrent delivery already opened this event");
                    return Disposition::Duplicate;
                }
                Err(e) if e.is_transient() && self.retry.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, retry_in_ms = delay.as_millis() as u64, "Occurrence write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.count_error();
                    self.engine.record_error();
                    error!(error = %e, attempts = attempt, "Failed to open occurrence");
                    return Disposition::Failed(e.to_string());
                }
            }
        }
    }

    async fn already_opened(&self, event: &RawDeathEvent) -> Result<bool, StoreError> {
        let mut attempt = 1;
        loop {
            match self
                .occurrences
                .exists_for_event(event.hospital_id, &event.event_id)
                .await
            {
                Err(e) if e.is_transient() && self.retry.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, retry_in_ms = delay.as_millis() as u64, "Dedup lookup failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    fn touch_processed(&self) {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.roll_day(now);
        state.status.total_processed += 1;
        state.status.last_processed_at = Some(now);
    }

    fn count_detected(&self) {
        let mut state = self.state.lock();
        state.roll_day(Utc::now());
        state.status.detected_today += 1;
    }

    fn count_error(&self) {
        self.state.lock().status.error_count += 1;
    }
}
