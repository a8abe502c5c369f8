//! Event records carried by the analytics and log streams.
//!
//! Both record types serialize directly to their wire shape: absent fields
//! are omitted, never emitted as `null`, and timestamps use millisecond UTC
//! ISO 8601 with a `Z` suffix. The persisted queue files use the same shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum length of `group_tag` and of each taxonomy level.
pub const GROUP_TAG_MAX_LENGTH: usize = 32;
pub const TAXONOMY_MAX_LENGTH: usize = 32;

/// Wire timestamp format, e.g. `2024-03-01T12:00:00.123Z`.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp the way the ingestion API expects it.
pub fn format_wire_time(time: &DateTime<Utc>) -> String {
    time.format(WIRE_TIME_FORMAT).to_string()
}

/// Serde adapter for [`WIRE_TIME_FORMAT`] timestamps.
pub mod wire_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_wire_time(time))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|time| time.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub(crate) fn truncate_chars(value: &mut String, max: usize) {
    if let Some((idx, _)) = value.char_indices().nth(max) {
        value.truncate(idx);
    }
}

/// Seven-level classification of an analytics event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Taxonomy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kingdom: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phylum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
}

impl Taxonomy {
    /// Build a taxonomy from the top down; levels beyond seven are ignored.
    ///
    /// ```
    /// use telemetry_shipper::event::Taxonomy;
    ///
    /// let t = Taxonomy::path(&["level", "complete", "world_1"]);
    /// assert_eq!(t.kingdom.as_deref(), Some("level"));
    /// assert_eq!(t.class.as_deref(), Some("world_1"));
    /// assert!(t.order.is_none());
    /// ```
    pub fn path(levels: &[&str]) -> Self {
        let mut taxonomy = Self::default();
        for (slot, level) in taxonomy.levels_mut().into_iter().zip(levels) {
            *slot = Some((*level).to_string());
        }
        taxonomy
    }

    fn levels_mut(&mut self) -> [&mut Option<String>; 7] {
        [
            &mut self.kingdom,
            &mut self.phylum,
            &mut self.class,
            &mut self.order,
            &mut self.family,
            &mut self.genus,
            &mut self.species,
        ]
    }

    fn truncate(&mut self) {
        for level in self.levels_mut().into_iter().flatten() {
            truncate_chars(level, TAXONOMY_MAX_LENGTH);
        }
    }
}

/// Spend details of an economy event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Economy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend_currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend_amount: Option<f64>,
}

/// A message sent to a list of recipients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSend {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_list: Option<Vec<String>>,
}

/// A click on a message previously sent to `to_tag`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageClick {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_tag: Option<String>,
}

/// Kind-specific fields, projected onto the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    #[serde(rename = "event")]
    Plain,
    Economy(Economy),
    MessageSend(MessageSend),
    MessageClick(MessageClick),
}

/// One analytics item on the `events` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    #[serde(with = "wire_time")]
    pub event_datetime: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: EventKind,

    /// Assigned by the stream at enqueue time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_index: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_tag: Option<String>,

    #[serde(flatten)]
    pub taxonomy: Taxonomy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float3: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float4: Option<f64>,
}

impl AnalyticsEvent {
    /// Create an event of the given kind stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            event_datetime: Utc::now(),
            kind,
            event_index: None,
            group_tag: None,
            taxonomy: Taxonomy::default(),
            float1: None,
            float2: None,
            float3: None,
            float4: None,
        }
    }

    /// A plain `event` with the given taxonomy path.
    pub fn plain(levels: &[&str]) -> Self {
        Self::new(EventKind::Plain).with_taxonomy(Taxonomy::path(levels))
    }

    /// An `economy` event spending `amount` of `currency`.
    pub fn economy(currency: impl Into<String>, amount: f64) -> Self {
        Self::new(EventKind::Economy(Economy {
            spend_type: None,
            spend_currency: Some(currency.into()),
            spend_amount: Some(amount),
        }))
    }

    pub fn with_taxonomy(mut self, taxonomy: Taxonomy) -> Self {
        self.taxonomy = taxonomy;
        self
    }

    pub fn with_group_tag(mut self, group_tag: impl Into<String>) -> Self {
        self.group_tag = Some(group_tag.into());
        self
    }

    /// Reject economy events without a currency or amount.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let EventKind::Economy(economy) = &self.kind {
            if economy
                .spend_currency
                .as_deref()
                .map_or(true, str::is_empty)
            {
                return Err(ValidationError::MissingSpendCurrency);
            }
            if economy.spend_amount.is_none() {
                return Err(ValidationError::MissingSpendAmount);
            }
        }
        Ok(())
    }

    /// Clamp classification fields to their maximum lengths.
    pub(crate) fn truncate_fields(&mut self) {
        if let Some(group_tag) = self.group_tag.as_mut() {
            truncate_chars(group_tag, GROUP_TAG_MAX_LENGTH);
        }
        self.taxonomy.truncate();
    }
}

/// Log severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Fatal => write!(f, "fatal"),
        }
    }
}

/// One application log line on the `logs` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(with = "wire_time")]
    pub event_datetime: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_ms: Option<f64>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_line: String,
}

impl LogEvent {
    /// Create a log event for `log_line` stamped with the current time.
    pub fn new(log_line: impl Into<String>) -> Self {
        Self {
            event_datetime: Utc::now(),
            hostname: None,
            filename: None,
            log_level: None,
            device_tag: None,
            user_tag: None,
            remote_address: None,
            response_bytes: None,
            response_ms: None,
            log_line: log_line.into(),
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.log_line.is_empty() {
            return Err(ValidationError::EmptyLogLine);
        }
        Ok(())
    }
}
