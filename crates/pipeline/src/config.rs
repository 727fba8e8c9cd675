// Pipeline Configuration
//
// Loaded from environment variables with defaults; builder setters for tests.

use std::env;
use std::time::Duration;

use uuid::Uuid;
use vigil_core::MAX_WINDOW_HOURS;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Ingestion and triage settings
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Capture window length after death
    pub window_hours: u32,
    /// Messages read per stream poll
    pub batch_size: usize,
    /// Upper bound on a blocking stream read
    pub read_timeout: Duration,
    /// Sleep after an empty poll, doubled while idle
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
    /// Cap for exponential backoff after stream errors
    pub error_backoff_max: Duration,
    /// Attempts at persisting an occurrence before the event is failed
    pub store_max_attempts: u32,
    /// How long a tenant's RuleSet is cached
    pub rules_cache_ttl: Duration,
    /// Tenant used for events without a tenant id
    pub default_tenant_id: Uuid,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_hours: 6,
            batch_size: 10,
            read_timeout: Duration::from_millis(5000),
            idle_backoff_min: Duration::from_millis(100),
            idle_backoff_max: Duration::from_millis(3000),
            error_backoff_max: Duration::from_millis(30_000),
            store_max_attempts: 3,
            rules_cache_ttl: Duration::from_secs(300),
            default_tenant_id: Uuid::nil(),
        }
    }
}

impl PipelineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `VIGIL_WINDOW_HOURS` (default: 6, clamped to 1..=8760)
    /// - `VIGIL_STREAM_BATCH_SIZE` (default: 10)
    /// - `VIGIL_STREAM_READ_TIMEOUT_MS` (default: 5000)
    /// - `VIGIL_IDLE_BACKOFF_MIN_MS` / `VIGIL_IDLE_BACKOFF_MAX_MS` (default: 100 / 3000)
    /// - `VIGIL_ERROR_BACKOFF_MAX_MS` (default: 30000)
    /// - `VIGIL_STORE_MAX_ATTEMPTS` (default: 3)
    /// - `VIGIL_RULES_CACHE_TTL_SECS` (default: 300)
    /// - `VIGIL_DEFAULT_TENANT_ID` (default: nil UUID)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            env_parse::<u64>(key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            window_hours: env_parse::<u32>("VIGIL_WINDOW_HOURS")
                .unwrap_or(defaults.window_hours)
                .clamp(1, MAX_WINDOW_HOURS),
            batch_size: env_parse::<usize>("VIGIL_STREAM_BATCH_SIZE")
                .unwrap_or(defaults.batch_size)
                .max(1),
            read_timeout: millis("VIGIL_STREAM_READ_TIMEOUT_MS", defaults.read_timeout),
            idle_backoff_min: millis("VIGIL_IDLE_BACKOFF_MIN_MS", defaults.idle_backoff_min),
            idle_backoff_max: millis("VIGIL_IDLE_BACKOFF_MAX_MS", defaults.idle_backoff_max),
            error_backoff_max: millis("VIGIL_ERROR_BACKOFF_MAX_MS", defaults.error_backoff_max),
            store_max_attempts: env_parse::<u32>("VIGIL_STORE_MAX_ATTEMPTS")
                .unwrap_or(defaults.store_max_attempts)
                .max(1),
            rules_cache_ttl: env_parse::<u64>("VIGIL_RULES_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rules_cache_ttl),
            default_tenant_id: env_parse("VIGIL_DEFAULT_TENANT_ID")
                .unwrap_or(defaults.default_tenant_id),
        }
    }

    pub fn with_window_hours(mut self, hours: u32) -> Self {
        self.window_hours = hours.clamp(1, MAX_WINDOW_HOURS);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_idle_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.idle_backoff_min = min;
        self.idle_backoff_max = max.max(min);
        self
    }

    pub fn with_error_backoff_max(mut self, max: Duration) -> Self {
        self.error_backoff_max = max;
        self
    }

    pub fn with_store_max_attempts(mut self, attempts: u32) -> Self {
        self.store_max_attempts = attempts.max(1);
        self
    }

    pub fn with_rules_cache_ttl(mut self, ttl: Duration) -> Self {
        self.rules_cache_ttl = ttl;
        self
    }

    pub fn with_default_tenant(mut self, tenant_id: Uuid) -> Self {
        self.default_tenant_id = tenant_id;
        self
    }
}

/// Notification hub settings
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Bounded per-session queue; the oldest event is dropped when full
    pub session_buffer: usize,
    /// Capacity of the signal channel feeding the broadcast loop
    pub signal_buffer: usize,
    /// Per-attempt timeout for channel senders
    pub send_timeout: Duration,
    /// Attempts per channel send, including the first
    pub send_max_attempts: u32,
    /// Link included in email and push bodies
    pub dashboard_url: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session_buffer: 100,
            signal_buffer: 1024,
            send_timeout: Duration::from_millis(10_000),
            send_max_attempts: 3,
            dashboard_url: None,
        }
    }
}

impl HubConfig {
    /// Environment variables:
    /// - `VIGIL_SESSION_BUFFER` (default: 100)
    /// - `VIGIL_HUB_SIGNAL_BUFFER` (default: 1024)
    /// - `VIGIL_SEND_TIMEOUT_MS` (default: 10000)
    /// - `VIGIL_SEND_MAX_ATTEMPTS` (default: 3)
    /// - `VIGIL_DASHBOARD_URL`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session_buffer: env_parse::<usize>("VIGIL_SESSION_BUFFER")
                .unwrap_or(defaults.session_buffer)
                .max(1),
            signal_buffer: env_parse::<usize>("VIGIL_HUB_SIGNAL_BUFFER")
                .unwrap_or(defaults.signal_buffer)
                .max(1),
            send_timeout: env_parse::<u64>("VIGIL_SEND_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.send_timeout),
            send_max_attempts: env_parse::<u32>("VIGIL_SEND_MAX_ATTEMPTS")
                .unwrap_or(defaults.send_max_attempts)
                .max(1),
            dashboard_url: env_nonempty("VIGIL_DASHBOARD_URL"),
        }
    }

    pub fn with_session_buffer(mut self, size: usize) -> Self {
        self.session_buffer = size.max(1);
        self
    }

    pub fn with_signal_buffer(mut self, size: usize) -> Self {
        self.signal_buffer = size.max(1);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_send_max_attempts(mut self, attempts: u32) -> Self {
        self.send_max_attempts = attempts.max(1);
        self
    }

    /// Upper bound on one delivery: every attempt timing out, plus a second of
    /// backoff between attempts
    pub fn delivery_deadline(&self) -> Duration {
        let attempts = self.send_max_attempts.max(1);
        self.send_timeout
            .saturating_mul(attempts)
            .saturating_add(Duration::from_secs(u64::from(attempts - 1)))
    }

    pub fn with_dashboard_url(mut self, url: impl Into<String>) -> Self {
        self.dashboard_url = Some(url.into());
        self
    }
}

/// Twilio SMS credentials
#[derive(Debug, Clone, PartialEq)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub api_base: String,
}

impl TwilioConfig {
    /// Returns None unless SID, token and sender number are all set
    pub fn from_env() -> Option<Self> {
        Some(Self {
            account_sid: env_nonempty("TWILIO_ACCOUNT_SID")?,
            auth_token: env_nonempty("TWILIO_AUTH_TOKEN")?,
            from_number: env_nonempty("TWILIO_PHONE_NUMBER")?,
            api_base: env_nonempty("TWILIO_API_BASE")
                .unwrap_or_else(|| "https://api.twilio.com".to_string()),
        })
    }
}

/// Firebase Cloud Messaging (legacy HTTP API) credentials
#[derive(Debug, Clone, PartialEq)]
pub struct FcmConfig {
    pub server_key: String,
    pub url: String,
}

impl FcmConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            server_key: env_nonempty("FCM_SERVER_KEY")?,
            url: env_nonempty("FCM_URL")
                .unwrap_or_else(|| "https://fcm.googleapis.com/fcm/send".to_string()),
        })
    }
}

/// Transactional email HTTP API credentials
#[derive(Debug, Clone, PartialEq)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_token: String,
    pub from: String,
}

impl EmailConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_url: env_nonempty("EMAIL_API_URL")?,
            api_token: env_nonempty("EMAIL_API_TOKEN")?,
            from: env_nonempty("EMAIL_FROM")?,
        })
    }
}

/// Channel sender credentials; absent channels are not registered
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderConfig {
    pub twilio: Option<TwilioConfig>,
    pub fcm: Option<FcmConfig>,
    pub email: Option<EmailConfig>,
}

impl SenderConfig {
    pub fn from_env() -> Self {
        Self {
            twilio: TwilioConfig::from_env(),
            fcm: FcmConfig::from_env(),
            email: EmailConfig::from_env(),
        }
    }

    pub fn configured_channels(&self) -> Vec<&'static str> {
        let mut channels = Vec::new();
        if self.email.is_some() {
            channels.push("email");
        }
        if self.twilio.is_some() {
            channels.push("sms");
        }
        if self.fcm.is_some() {
            channels.push("push");
        }
        channels
    }
}
