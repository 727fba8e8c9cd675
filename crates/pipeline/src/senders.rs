// Outbound channel senders
//
// Each external channel (email, SMS, push) is a ChannelSender over reqwest.
// Senders only deliver; recording the attempt is the dispatcher's job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use vigil_core::{NotificationChannel, Urgency};

use crate::config::{EmailConfig, FcmConfig, SenderConfig, TwilioConfig};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("channel not configured: {0}")]
    NotConfigured(NotificationChannel),

    #[error("no delivery target")]
    NoTarget,

    #[error("request failed: {0}")]
    Http(String),

    #[error("provider rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("send timed out")]
    Timeout,
}

impl SendError {
    /// Worth another attempt: timeouts, transport errors and provider 5xx/429
    pub fn is_transient(&self) -> bool {
        match self {
            SendError::Timeout | SendError::Http(_) => true,
            SendError::Rejected { status, .. } => *status >= 500 || *status == 429,
            SendError::NotConfigured(_) | SendError::NoTarget => false,
        }
    }
}

impl From<reqwest::Error> for SendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SendError::Timeout
        } else {
            SendError::Http(e.to_string())
        }
    }
}

/// Channel-neutral alert content
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub occurrence_id: Uuid,
    pub hospital_id: Uuid,
    pub subject: String,
    pub body: String,
    pub urgency: Urgency,
    /// Deep link into the dashboard, when one is configured
    pub link: Option<String>,
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    /// Deliver to the given targets (addresses, phone numbers or device tokens)
    async fn send(&self, targets: &[String], message: &OutboundMessage) -> Result<(), SendError>;
}

pub type SenderMap = HashMap<NotificationChannel, Arc<dyn ChannelSender>>;

/// Build a sender for every channel that has credentials
///
/// `timeout` bounds each HTTP attempt; `retry` decides how many attempts a
/// send gets on transient failures.
pub fn build_senders(
    config: &SenderConfig,
    timeout: Duration,
    retry: RetryPolicy,
) -> Result<SenderMap, SendError> {
    let client = Client::builder().timeout(timeout).build()?;
    let mut senders: SenderMap = HashMap::new();
    if let Some(twilio) = &config.twilio {
        senders.insert(
            NotificationChannel::Sms,
            Arc::new(RetryingSender::new(
                Arc::new(TwilioSmsSender::new(client.clone(), twilio.clone())),
                retry.clone(),
            )),
        );
    }
    if let Some(fcm) = &config.fcm {
        senders.insert(
            NotificationChannel::Push,
            Arc::new(RetryingSender::new(
                Arc::new(FcmPushSender::new(client.clone(), fcm.clone())),
                retry.clone(),
            )),
        );
    }
    if let Some(email) = &config.email {
        senders.insert(
            NotificationChannel::Email,
            Arc::new(RetryingSender::new(
                Arc::new(HttpEmailSender::new(client, email.clone())),
                retry,
            )),
        );
    }
    Ok(senders)
}

/// Retries transient send failures of the wrapped sender
///
/// A retry repeats the whole send, so a multi-target SMS may reach earlier
/// numbers twice when a later one fails.
pub struct RetryingSender {
    inner: Arc<dyn ChannelSender>,
    policy: RetryPolicy,
}

impl RetryingSender {
    pub fn new(inner: Arc<dyn ChannelSender>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ChannelSender for RetryingSender {
    fn channel(&self) -> NotificationChannel {
        self.inner.channel()
    }

    async fn send(&self, targets: &[String], message: &OutboundMessage) -> Result<(), SendError> {
        let mut attempt = 1;
        loop {
            match self.inner.send(targets, message).await {
                Err(e) if e.is_transient() && self.policy.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        channel = %self.inner.channel(),
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), SendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(SendError::Rejected {
        status: status.as_u16(),
        body,
    })
}

// ============================================================================
// SMS (Twilio)
// ============================================================================

pub struct TwilioSmsSender {
    client: Client,
    config: TwilioConfig,
}

impl TwilioSmsSender {
    pub fn new(client: Client, config: TwilioConfig) -> Self {
        Self { client, config }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

/// SMS bodies stay short: subject plus link
fn sms_text(message: &OutboundMessage) -> String {
    match &message.link {
        Some(link) => format!("{} {}", message.subject, link),
        None => message.subject.clone(),
    }
}

#[async_trait]
impl ChannelSender for TwilioSmsSender {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Sms
    }

    async fn send(&self, targets: &[String], message: &OutboundMessage) -> Result<(), SendError> {
        if targets.is_empty() {
            return Err(SendError::NoTarget);
        }
        let body = sms_text(message);
        for to in targets {
            let response = self
                .client
                .post(self.messages_url())
                .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
                .form(&[
                    ("To", to.as_str()),
                    ("From", self.config.from_number.as_str()),
                    ("Body", body.as_str()),
                ])
                .send()
                .await?;
            check_status(response).await?;
            debug!(occurrence_id = %message.occurrence_id, "SMS sent");
        }
        Ok(())
    }
}

// ============================================================================
// Push (FCM)
// ============================================================================

pub struct FcmPushSender {
    client: Client,
    config: FcmConfig,
}

impl FcmPushSender {
    pub fn new(client: Client, config: FcmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChannelSender for FcmPushSender {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Push
    }

    async fn send(&self, targets: &[String], message: &OutboundMessage) -> Result<(), SendError> {
        if targets.is_empty() {
            return Err(SendError::NoTarget);
        }
        let payload = json!({
            "registration_ids": targets,
            "priority": "high",
            "notification": {
                "title": message.subject,
                "body": message.body,
            },
            "data": {
                "occurrence_id": message.occurrence_id,
                "hospital_id": message.hospital_id,
                "urgency": message.urgency,
                "url": message.link,
            },
        });
        let response = self
            .client
            .post(&self.config.url)
            .header("Authorization", format!("key={}", self.config.server_key))
            .json(&payload)
            .send()
            .await?;
        check_status(response).await?;
        debug!(occurrence_id = %message.occurrence_id, devices = targets.len(), "Push sent");
        Ok(())
    }
}

// ============================================================================
// Email (HTTP API)
// ============================================================================

pub struct HttpEmailSender {
    client: Client,
    config: EmailConfig,
}

impl HttpEmailSender {
    pub fn new(client: Client, config: EmailConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChannelSender for HttpEmailSender {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Email
    }

    async fn send(&self, targets: &[String], message: &OutboundMessage) -> Result<(), SendError> {
        if targets.is_empty() {
            return Err(SendError::NoTarget);
        }
        let text = match &message.link {
            Some(link) => format!("{}\n\n{}", message.body, link),
            None => message.body.clone(),
        };
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_token)
            .json(&json!({
                "from": self.config.from,
                "to": targets,
                "subject": message.subject,
                "text": text,
            }))
            .send()
            .await?;
        check_status(response).await?;
        debug!(occurrence_id = %message.occurrence_id, "Email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> OutboundMessage {
        OutboundMessage {
            occurrence_id: Uuid::now_v7(),
            hospital_id: Uuid::now_v7(),
            subject: "New eligible occurrence".to_string(),
            body: "J*** S*** in UTI, 5h 30min left".to_string(),
            urgency: Urgency::Green,
            link: Some("https://vigil.example/occurrences/1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_twilio_posts_form_per_number() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .respond_with(ResponseTemplate::new(201))
            .expect(2)
            .mount(&server)
            .await;

        let sender = TwilioSmsSender::new(
            Client::new(),
            TwilioConfig {
                account_sid: "AC123".to_string(),
                auth_token: "secret".to_string(),
                from_number: "+15550000".to_string(),
                api_base: server.uri(),
            },
        );
        let targets = vec!["+5511999990001".to_string(), "+5511999990002".to_string()];
        sender.send(&targets, &message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fcm_rejection_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "key=server-key"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let sender = FcmPushSender::new(
            Client::new(),
            FcmConfig {
                server_key: "server-key".to_string(),
                url: format!("{}/fcm/send", server.uri()),
            },
        );
        let err = sender
            .send(&["device-token".to_string()], &message())
            .await
            .unwrap_err();
        match err {
            SendError::Rejected { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_email_uses_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("Authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = HttpEmailSender::new(
            Client::new(),
            EmailConfig {
                api_url: format!("{}/send", server.uri()),
                api_token: "token-1".to_string(),
                from: "alerts@vigil.example".to_string(),
            },
        );
        sender
            .send(&["op@hospital.example".to_string()], &message())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let sender = HttpEmailSender::new(
            client,
            EmailConfig {
                api_url: server.uri(),
                api_token: "t".to_string(),
                from: "alerts@vigil.example".to_string(),
            },
        );
        let err = sender
            .send(&["op@hospital.example".to_string()], &message())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Timeout));
    }

    #[tokio::test]
    async fn test_empty_targets() {
        let sender = HttpEmailSender::new(
            Client::new(),
            EmailConfig {
                api_url: "http://127.0.0.1:1".to_string(),
                api_token: "t".to_string(),
                from: "alerts@vigil.example".to_string(),
            },
        );
        assert!(matches!(
            sender.send(&[], &message()).await,
            Err(SendError::NoTarget)
        ));
    }

    #[test]
    fn test_build_senders_only_configured() {
        let config = SenderConfig {
            twilio: None,
            fcm: None,
            email: Some(EmailConfig {
                api_url: "http://localhost/send".to_string(),
                api_token: "t".to_string(),
                from: "a@b".to_string(),
            }),
        };
        let senders =
            build_senders(&config, Duration::from_secs(5), RetryPolicy::no_retry()).unwrap();
        assert_eq!(senders.len(), 1);
        assert!(senders.contains_key(&NotificationChannel::Email));
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_max_attempts(attempts)
            .with_initial_interval(Duration::from_millis(1))
            .with_jitter(0.0)
    }

    fn email_sender(server: &MockServer, retry: RetryPolicy) -> RetryingSender {
        RetryingSender::new(
            Arc::new(HttpEmailSender::new(
                Client::new(),
                EmailConfig {
                    api_url: format!("{}/send", server.uri()),
                    api_token: "token-1".to_string(),
                    from: "alerts@vigil.example".to_string(),
                },
            )),
            retry,
        )
    }

    #[tokio::test]
    async fn test_server_error_retried_until_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = email_sender(&server, fast_retry(3));
        assert_eq!(sender.channel(), NotificationChannel::Email);
        sender
            .send(&["op@hospital.example".to_string()], &message())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_rejection_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad address"))
            .expect(1)
            .mount(&server)
            .await;

        let err = email_sender(&server, fast_retry(3))
            .send(&["not-an-address".to_string()], &message())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let err = email_sender(&server, fast_retry(2))
            .send(&["op@hospital.example".to_string()], &message())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, SendError::Rejected { status: 500, .. }));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SendError::Timeout.is_transient());
        assert!(SendError::Http("reset".into()).is_transient());
        let rejected = |status| SendError::Rejected {
            status,
            body: String::new(),
        };
        assert!(rejected(429).is_transient());
        assert!(rejected(502).is_transient());
        assert!(!rejected(401).is_transient());
        assert!(!SendError::NoTarget.is_transient());
        assert!(!SendError::NotConfigured(NotificationChannel::Sms).is_transient());
    }
}
