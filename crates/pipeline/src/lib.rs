// Vigil pipeline
//
// Background half of the system: the event ingestor that turns stream
// messages into occurrences, and the notification hub that fans occurrence
// signals out to live sessions and external channels.

pub mod config;
pub mod hub;
pub mod ingestor;
pub mod retry;
pub mod rules_cache;
pub mod senders;
pub mod stream;

pub use config::{EmailConfig, FcmConfig, HubConfig, PipelineConfig, SenderConfig, TwilioConfig};
pub use hub::{
    live_event, Dispatcher, HubError, HubHandle, HubStats, LiveEvent, NotificationHub, SessionHandle,
    SessionInfo, SessionRegistry, SessionRole, SessionScope,
};
pub use ingestor::{Disposition, EventIngestor, IngestorStatus};
pub use retry::{Backoff, RetryPolicy};
pub use rules_cache::RuleSetCache;
pub use senders::{
    build_senders, ChannelSender, FcmPushSender, HttpEmailSender, OutboundMessage,
    RetryingSender, SendError, SenderMap, TwilioSmsSender,
};
pub use stream::{EventStream, InMemoryEventStream, PostgresEventStream, StreamError, StreamMessage};
