//! Stream definitions: what each pipeline carries and how a batch is framed.
//!
//! A stream pairs an item type with a name (used for the worker thread and
//! the queue file), an API path, and a payload encoder that wraps a batch in
//! the shared request envelope.

use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::event::{AnalyticsEvent, LogEvent};

/// Analytics stream name and path.
pub const EVENT_STREAM: &str = "events";
pub const EVENT_PATH: &str = "/1/track";

/// Log stream name and path.
pub const LOG_STREAM: &str = "logs";
pub const LOG_PATH: &str = "/1/app_log";

/// Per-request envelope describing the application and device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub api_key: String,
    pub app_ver: String,
    pub device_tag: String,
    pub os: String,
    pub os_ver: String,
    pub device_family: String,
    pub device_type: String,
    pub language: String,
    pub country: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facebook_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twitter_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_center_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_ver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_ver: Option<String>,
}

impl Envelope {
    pub fn from_config(config: &Config, device_tag: impl Into<String>) -> Self {
        Self {
            api_key: config.api_key.clone(),
            app_ver: config.app_version.clone(),
            device_tag: device_tag.into(),
            os: Config::os_name().to_string(),
            os_ver: config.os_version.clone(),
            device_family: config.device_family.clone(),
            device_type: config.device_type.clone(),
            language: config.language.clone(),
            country: config.country.clone(),
            user_tag: None,
            facebook_tag: None,
            twitter_tag: None,
            google_tag: None,
            game_center_tag: None,
            server_ver: None,
            config_ver: None,
        }
    }
}

/// Envelope shared by the client (which updates tags) and both streams.
pub type SharedEnvelope = Arc<RwLock<Envelope>>;

#[derive(Serialize)]
struct Payload<'a, I> {
    #[serde(flatten)]
    envelope: &'a Envelope,
    events: &'a [I],
}

/// Serialize `batch` inside the current envelope.
pub fn encode_batch<I: Serialize>(
    envelope: &SharedEnvelope,
    batch: &[I],
) -> Result<Vec<u8>, serde_json::Error> {
    let envelope = envelope.read().unwrap_or_else(PoisonError::into_inner);
    serde_json::to_vec(&Payload {
        envelope: &envelope,
        events: batch,
    })
}

/// One independent pipeline handled by a [`crate::sender::Sender`].
///
/// The stream value lives on the sender's worker thread, so the hooks may
/// keep mutable per-stream state without locking.
pub trait Stream: Send + 'static {
    type Item: Serialize + DeserializeOwned + Clone + Send + 'static;

    /// Worker thread and queue file name.
    fn name(&self) -> &'static str;

    /// API path appended to the base URL.
    fn path(&self) -> &'static str;

    /// Called once with the items recovered from disk.
    fn on_recover(&mut self, _items: &[Self::Item]) {}

    /// Called on the worker just before an item joins the pending list.
    fn on_enqueue(&mut self, _item: &mut Self::Item) {}

    /// Wire bytes for one batch.
    fn encode(&self, batch: &[Self::Item]) -> Result<Vec<u8>, serde_json::Error>;
}

/// Analytics events; assigns `event_index` at enqueue.
pub struct EventStream {
    envelope: SharedEnvelope,
    next_index: u64,
}

impl EventStream {
    pub fn new(envelope: SharedEnvelope) -> Self {
        Self {
            envelope,
            next_index: 1,
        }
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}

impl Stream for EventStream {
    type Item = AnalyticsEvent;

    fn name(&self) -> &'static str {
        EVENT_STREAM
    }

    fn path(&self) -> &'static str {
        EVENT_PATH
    }

    fn on_recover(&mut self, items: &[AnalyticsEvent]) {
        // Recovered events keep their indexes; continue after the largest
        if let Some(max) = items.iter().filter_map(|e| e.event_index).max() {
            self.next_index = self.next_index.max(max + 1);
        }
    }

    fn on_enqueue(&mut self, item: &mut AnalyticsEvent) {
        item.event_index = Some(self.next_index);
        self.next_index += 1;
    }

    fn encode(&self, batch: &[AnalyticsEvent]) -> Result<Vec<u8>, serde_json::Error> {
        encode_batch(&self.envelope, batch)
    }
}

/// Application log lines.
pub struct LogStream {
    envelope: SharedEnvelope,
}

impl LogStream {
    pub fn new(envelope: SharedEnvelope) -> Self {
        Self { envelope }
    }
}

impl Stream for LogStream {
    type Item = LogEvent;

    fn name(&self) -> &'static str {
        LOG_STREAM
    }

    fn path(&self) -> &'static str {
        LOG_PATH
    }

    fn encode(&self, batch: &[LogEvent]) -> Result<Vec<u8>, serde_json::Error> {
        encode_batch(&self.envelope, batch)
    }
}

#[cfg(test)]
pub(crate) fn test_envelope() -> SharedEnvelope {
    let config = Config::new("test-key", "Test Org");
    Arc::new(RwLock::new(Envelope::from_config(&config, "device-1")))
}
