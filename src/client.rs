//! Client handle tying the two streams to one identity.
//!
//! A [`Client`] owns the analytics stream (`/1/track`) and the log stream
//! (`/1/app_log`), the request envelope they share, and the settings that
//! keep the device tag, user tags and install flag across runs.
//!
//! # Example
//!
//! ```no_run
//! use telemetry_shipper::client::Client;
//! use telemetry_shipper::config::Config;
//! use telemetry_shipper::event::AnalyticsEvent;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let client = Client::new(config).expect("Failed to start client");
//!
//!     client
//!         .event(AnalyticsEvent::plain(&["level", "start"]))
//!         .expect("valid event");
//!     client.log_line("level loaded").expect("non-empty line");
//!
//!     client.flush().await;
//! }
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use tokio::runtime::Handle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ClientError, ValidationError};
use crate::event::{truncate_chars, AnalyticsEvent, LogEvent, LogLevel};
use crate::sender::{DropHandler, Sender, SenderOptions, StreamStatus};
use crate::settings::Settings;
use crate::store::PersistenceStore;
use crate::stream::{Envelope, EventStream, LogStream, SharedEnvelope};
use crate::transport::{HttpTransport, Transport};

/// Maximum length of a user or provider tag.
pub const TAG_MAX_LENGTH: usize = 62;

/// Maximum length of the server and config version strings.
pub const VERSION_MAX_LENGTH: usize = 16;

const DEVICE_TAG_KEY: &str = "DeviceTag";
const USER_TAG_PREFIX_KEY: &str = "UserTag";
const INSTALL_SENT_KEY: &str = "InstallSent";

/// Identity tags carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    User,
    Facebook,
    Twitter,
    Google,
    GameCenter,
}

impl TagKind {
    pub const ALL: [TagKind; 5] = [
        TagKind::User,
        TagKind::Facebook,
        TagKind::Twitter,
        TagKind::Google,
        TagKind::GameCenter,
    ];

    /// Settings key the tag is persisted under.
    pub fn settings_key(self) -> String {
        let provider = match self {
            TagKind::User => "",
            TagKind::Facebook => "Facebook",
            TagKind::Twitter => "Twitter",
            TagKind::Google => "Google",
            TagKind::GameCenter => "GameCenter",
        };
        format!("{USER_TAG_PREFIX_KEY}{provider}")
    }

    fn get(self, envelope: &Envelope) -> Option<&String> {
        match self {
            TagKind::User => envelope.user_tag.as_ref(),
            TagKind::Facebook => envelope.facebook_tag.as_ref(),
            TagKind::Twitter => envelope.twitter_tag.as_ref(),
            TagKind::Google => envelope.google_tag.as_ref(),
            TagKind::GameCenter => envelope.game_center_tag.as_ref(),
        }
    }

    fn slot(self, envelope: &mut Envelope) -> &mut Option<String> {
        match self {
            TagKind::User => &mut envelope.user_tag,
            TagKind::Facebook => &mut envelope.facebook_tag,
            TagKind::Twitter => &mut envelope.twitter_tag,
            TagKind::Google => &mut envelope.google_tag,
            TagKind::GameCenter => &mut envelope.game_center_tag,
        }
    }
}

/// Status of both streams at one moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub events: StreamStatus,
    pub logs: StreamStatus,
}

impl ClientStatus {
    pub fn is_drained(&self) -> bool {
        self.events.is_drained() && self.logs.is_drained()
    }
}

/// Builder for [`Client`] with injectable collaborators.
pub struct ClientBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    settings: Option<Settings>,
    on_drop: Option<DropHandler>,
}

impl ClientBuilder {
    /// Use `transport` instead of the default reqwest transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use `settings` instead of opening them under the storage root.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Called for every batch the server refuses with 400, 403 or 409.
    pub fn on_drop(mut self, on_drop: DropHandler) -> Self {
        self.on_drop = Some(on_drop);
        self
    }

    /// Start both streams on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NoRuntime` outside a runtime, or an error if
    /// the HTTP client or a worker thread cannot be created.
    pub fn build(self) -> Result<Client, ClientError> {
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let config = self.config;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.request_timeout)?),
        };
        let settings = self.settings.unwrap_or_else(|| match &config.storage_root {
            Some(root) => Settings::open(root),
            None => Settings::in_memory(),
        });

        let device_tag = load_or_create_device_tag(&settings);
        let mut envelope = Envelope::from_config(&config, device_tag);
        for kind in TagKind::ALL {
            *kind.slot(&mut envelope) = settings.load::<String>(&kind.settings_key());
        }
        let envelope: SharedEnvelope = Arc::new(RwLock::new(envelope));

        let store = Arc::new(PersistenceStore::new(config.storage_root.clone()));
        let mut options = SenderOptions::from_config(&config);
        options.on_drop = self.on_drop;

        let events = Sender::start(
            EventStream::new(envelope.clone()),
            options.clone(),
            transport.clone(),
            store.clone(),
            runtime.clone(),
        )?;
        let logs = Sender::start(
            LogStream::new(envelope.clone()),
            options,
            transport,
            store,
            runtime,
        )?;

        info!(
            organization = %config.organization,
            base_url = %config.base_url(),
            persistent = config.storage_root.is_some(),
            "Telemetry client started"
        );

        let client = Client {
            config,
            settings,
            envelope,
            events,
            logs,
        };
        client.send_install_event();
        Ok(client)
    }
}

fn load_or_create_device_tag(settings: &Settings) -> String {
    match settings.load::<String>(DEVICE_TAG_KEY) {
        Some(tag) if !tag.is_empty() => tag,
        _ => {
            let tag = Uuid::new_v4().to_string();
            settings.save(DEVICE_TAG_KEY, &tag);
            debug!(device_tag = %tag, "Generated device tag");
            tag
        }
    }
}

/// Telemetry client for one application.
///
/// All enqueue methods return immediately; delivery happens on the stream
/// workers. Only validation errors reach the caller.
pub struct Client {
    config: Config,
    settings: Settings,
    envelope: SharedEnvelope,
    events: Sender<EventStream>,
    logs: Sender<LogStream>,
}

impl Client {
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder {
            config,
            transport: None,
            settings: None,
            on_drop: None,
        }
    }

    /// Build a client with the default transport and settings.
    pub fn new(config: Config) -> Result<Self, ClientError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Queue an analytics event of any kind.
    ///
    /// # Errors
    ///
    /// Economy events without a currency or amount are rejected and never
    /// queued.
    pub fn event(&self, mut event: AnalyticsEvent) -> Result<(), ValidationError> {
        event.validate()?;
        event.truncate_fields();
        self.events.add(event);
        Ok(())
    }

    /// Queue a structured log event.
    ///
    /// # Errors
    ///
    /// Rejects an empty `log_line`.
    pub fn log(&self, event: LogEvent) -> Result<(), ValidationError> {
        event.validate()?;
        self.logs.add(event);
        Ok(())
    }

    /// Queue a bare log line.
    pub fn log_line(&self, line: impl Into<String>) -> Result<(), ValidationError> {
        self.log(LogEvent::new(line))
    }

    /// Queue a log line at error level.
    pub fn log_error(&self, line: impl Into<String>) -> Result<(), ValidationError> {
        self.log(LogEvent::new(line).with_level(LogLevel::Error))
    }

    pub fn device_tag(&self) -> String {
        self.read_envelope(|e| e.device_tag.clone())
    }

    pub fn tag(&self, kind: TagKind) -> Option<String> {
        self.read_envelope(|e| kind.get(e).cloned())
    }

    /// Set or clear a tag; the stored value is returned after truncation.
    ///
    /// Applies to every batch encoded from now on, including retries of
    /// items queued earlier.
    pub fn set_tag(&self, kind: TagKind, value: Option<&str>) -> Option<String> {
        let value = value.map(|v| {
            let mut v = v.to_string();
            truncate_chars(&mut v, TAG_MAX_LENGTH);
            v
        });

        let key = kind.settings_key();
        match &value {
            Some(v) => self.settings.save(&key, v),
            None => self.settings.remove(&key),
        }
        self.write_envelope(|e| *kind.slot(e) = value.clone());
        value
    }

    pub fn server_version(&self) -> Option<String> {
        self.read_envelope(|e| e.server_ver.clone())
    }

    pub fn set_server_version(&self, version: Option<&str>) -> Option<String> {
        let version = version.map(truncate_version);
        self.write_envelope(|e| e.server_ver = version.clone());
        version
    }

    pub fn config_version(&self) -> Option<String> {
        self.read_envelope(|e| e.config_ver.clone())
    }

    pub fn set_config_version(&self, version: Option<&str>) -> Option<String> {
        let version = version.map(truncate_version);
        self.write_envelope(|e| e.config_ver = version.clone());
        version
    }

    /// Resolve once both streams are empty at the same time.
    ///
    /// Waits as long as delivery takes; wrap in `tokio::time::timeout` to
    /// bound it.
    pub async fn flush(&self) {
        tokio::join!(self.events.sync(), self.logs.sync());

        let mut events = self.events.subscribe();
        let mut logs = self.logs.subscribe();
        loop {
            let drained =
                events.borrow_and_update().is_drained() && logs.borrow_and_update().is_drained();
            if drained {
                debug!("Flush complete");
                return;
            }

            let changed = tokio::select! {
                changed = events.changed() => changed,
                changed = logs.changed() => changed,
            };
            if changed.is_err() {
                // A closed stream will never drain
                return;
            }
        }
    }

    pub fn stream_status(&self) -> ClientStatus {
        ClientStatus {
            events: self.events.status(),
            logs: self.logs.status(),
        }
    }

    /// Stop both stream workers. Unsent items stay in the queue files.
    pub fn shutdown(&mut self) {
        self.events.close();
        self.logs.close();
        info!("Telemetry client shut down");
    }

    fn send_install_event(&self) {
        if self.settings.load::<bool>(INSTALL_SENT_KEY).unwrap_or(false) {
            return;
        }
        self.events.add(AnalyticsEvent::plain(&["organic"]));
        self.settings.save(INSTALL_SENT_KEY, &true);
        info!("Install event queued");
    }

    fn read_envelope<T>(&self, read: impl FnOnce(&Envelope) -> T) -> T {
        let envelope = self.envelope.read().unwrap_or_else(PoisonError::into_inner);
        read(&envelope)
    }

    fn write_envelope(&self, write: impl FnOnce(&mut Envelope)) {
        let mut envelope = self.envelope.write().unwrap_or_else(PoisonError::into_inner);
        write(&mut envelope);
    }
}

fn truncate_version(version: &str) -> String {
    let mut version = version.to_string();
    truncate_chars(&mut version, VERSION_MAX_LENGTH);
    version
}

/// One process-wide client for call sites that cannot carry a handle.
pub mod shared {
    use std::sync::OnceLock;

    use super::{Client, ClientBuilder};
    use crate::config::Config;
    use crate::error::ClientError;

    static CLIENT: OnceLock<Client> = OnceLock::new();

    /// Build and install the shared client.
    ///
    /// # Errors
    ///
    /// `AlreadyInitialized` if a shared client exists, or any build error.
    pub fn init(config: Config) -> Result<&'static Client, ClientError> {
        init_with(Client::builder(config))
    }

    /// Like [`init`], from a configured builder.
    pub fn init_with(builder: ClientBuilder) -> Result<&'static Client, ClientError> {
        if CLIENT.get().is_some() {
            return Err(ClientError::AlreadyInitialized);
        }
        // A racing init may win between the check and the set
        CLIENT
            .set(builder.build()?)
            .map_err(|_| ClientError::AlreadyInitialized)?;
        instance()
    }

    /// The shared client.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before a successful [`init`].
    pub fn instance() -> Result<&'static Client, ClientError> {
        CLIENT.get().ok_or(ClientError::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Economy, EventKind};
    use crate::sender::DroppedBatch;
    use crate::stream::{EVENT_PATH, LOG_PATH};
    use crate::transport::testing::{RecordingTransport, Reply};
    use std::sync::Mutex;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_config() -> Config {
        let mut config = Config::new("test-key", "Test Org");
        config.api_url = "http://ingest.test".to_string();
        config.poll_interval = Duration::from_millis(10);
        config.min_send_interval = Duration::from_millis(50);
        config.max_send_interval = Duration::from_millis(1_000);
        config
    }

    /// Settings that already recorded the install event.
    fn installed_settings() -> Settings {
        let settings = Settings::in_memory();
        settings.save(INSTALL_SENT_KEY, &true);
        settings
    }

    fn build(config: Config, transport: &Arc<RecordingTransport>, settings: Settings) -> Client {
        Client::builder(config)
            .transport(transport.clone())
            .settings(settings)
            .build()
            .unwrap()
    }

    async fn flush(client: &Client) {
        tokio::time::timeout(Duration::from_secs(10), client.flush())
            .await
            .expect("flush timed out");
    }

    /// Wait for pending queue file writes after a flush.
    async fn settle(client: &Client) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let status = client.stream_status();
                if !status.events.saving && !status.logs.saving {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue files never settled");
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = Client::builder(test_config())
            .transport(RecordingTransport::new())
            .build();
        assert!(matches!(result, Err(ClientError::NoRuntime)));
    }

    #[test]
    fn test_tag_settings_keys() {
        assert_eq!(TagKind::User.settings_key(), "UserTag");
        assert_eq!(TagKind::GameCenter.settings_key(), "UserTagGameCenter");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_economy_event_never_reaches_transport() {
        init_tracing();
        let transport = RecordingTransport::new();
        let client = build(test_config(), &transport, installed_settings());

        let missing_amount = AnalyticsEvent::new(EventKind::Economy(Economy {
            spend_type: None,
            spend_currency: Some("USD".to_string()),
            spend_amount: None,
        }));
        assert_eq!(
            client.event(missing_amount),
            Err(ValidationError::MissingSpendAmount)
        );
        assert_eq!(
            client.log(LogEvent::new("")),
            Err(ValidationError::EmptyLogLine)
        );

        flush(&client).await;
        assert!(transport.requests().is_empty());
        assert_eq!(client.stream_status().events.pending, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_log_lines_are_rejected() {
        let transport = RecordingTransport::new();
        let client = build(test_config(), &transport, installed_settings());

        assert_eq!(client.log_line(""), Err(ValidationError::EmptyLogLine));
        assert_eq!(client.log_error(""), Err(ValidationError::EmptyLogLine));

        flush(&client).await;
        assert!(transport.requests_to(LOG_PATH).is_empty());
        assert_eq!(client.stream_status().logs.pending, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_waits_for_both_streams() {
        init_tracing();
        let transport = RecordingTransport::new();
        transport.script(EVENT_PATH, &[Reply::Status(500), Reply::Status(500)]);
        let client = build(test_config(), &transport, installed_settings());

        client.event(AnalyticsEvent::plain(&["match", "won"])).unwrap();
        client.log_line("quick log").unwrap();

        flush(&client).await;

        let status = client.stream_status();
        assert!(status.is_drained());
        // The log stream emptied first; flush still waited for the retries
        assert_eq!(status.logs.stats.items_sent, 1);
        assert_eq!(status.events.stats.items_sent, 1);
        assert_eq!(status.events.stats.batches_requeued, 2);
        assert_eq!(transport.requests_to(EVENT_PATH).len(), 3);
        assert_eq!(transport.requests_to(LOG_PATH).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fields_are_truncated_at_enqueue() {
        let transport = RecordingTransport::new();
        let client = build(test_config(), &transport, installed_settings());

        let long = "x".repeat(40);
        client
            .event(AnalyticsEvent::plain(&[long.as_str()]).with_group_tag(long.as_str()))
            .unwrap();
        flush(&client).await;

        let requests = transport.requests_to(EVENT_PATH);
        let item = &requests[0].items()[0];
        assert_eq!(item["kingdom"].as_str().map(str::len), Some(32));
        assert_eq!(item["group_tag"].as_str().map(str::len), Some(32));
        assert_eq!(item["type"], "event");
        assert_eq!(item["event_index"], 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tags_and_versions_flow_into_envelope() {
        let transport = RecordingTransport::new();
        let client = build(test_config(), &transport, installed_settings());

        let stored = client.set_tag(TagKind::User, Some("u".repeat(70).as_str()));
        assert_eq!(stored.as_deref().map(str::len), Some(TAG_MAX_LENGTH));
        client.set_tag(TagKind::Google, Some("g-1"));
        assert_eq!(
            client.set_server_version(Some("1.2.3-build.456789")).as_deref(),
            Some("1.2.3-build.4567")
        );
        client.set_config_version(Some("cfg-7"));

        client.log_error("something broke").unwrap();
        flush(&client).await;

        let body = &transport.requests_to(LOG_PATH)[0].body;
        assert_eq!(body["user_tag"].as_str().map(str::len), Some(TAG_MAX_LENGTH));
        assert_eq!(body["google_tag"], "g-1");
        assert_eq!(body["server_ver"], "1.2.3-build.4567");
        assert_eq!(body["config_ver"], "cfg-7");
        assert!(body.get("twitter_tag").is_none());
        assert_eq!(body["events"][0]["log_level"], "error");
        assert_eq!(body["device_tag"], client.device_tag().as_str());

        client.set_tag(TagKind::Google, None);
        assert_eq!(client.tag(TagKind::Google), None);
        assert_eq!(client.settings().load::<String>("UserTagGoogle"), None);
        assert!(client.settings().load::<String>("UserTag").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_identity_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.storage_root = Some(dir.path().to_path_buf());

        let transport = RecordingTransport::new();
        let mut first = Client::builder(config.clone())
            .transport(transport.clone())
            .build()
            .unwrap();
        first.set_tag(TagKind::Twitter, Some("tw-42"));
        flush(&first).await;
        settle(&first).await;
        let device_tag = first.device_tag();
        first.shutdown();

        // Install event went out exactly once
        let install = transport.requests_to(EVENT_PATH);
        assert_eq!(install.len(), 1);
        assert_eq!(install[0].items()[0]["kingdom"], "organic");
        assert_eq!(install[0].items()[0]["type"], "event");

        let second = Client::builder(config)
            .transport(transport.clone())
            .build()
            .unwrap();
        assert_eq!(second.device_tag(), device_tag);
        assert_eq!(second.tag(TagKind::Twitter).as_deref(), Some("tw-42"));
        assert!(Uuid::parse_str(&device_tag).is_ok());

        flush(&second).await;
        assert_eq!(transport.requests_to(EVENT_PATH).len(), 1);
        assert_eq!(second.stream_status().events.stats.items_sent, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_handler_sees_rejected_batches() {
        let transport = RecordingTransport::new();
        transport.script(LOG_PATH, &[Reply::Status(403)]);

        let dropped: Arc<Mutex<Vec<DroppedBatch>>> = Arc::default();
        let sink = dropped.clone();
        let client = Client::builder(test_config())
            .transport(transport.clone())
            .settings(installed_settings())
            .on_drop(Arc::new(move |batch: &DroppedBatch| {
                sink.lock().unwrap().push(batch.clone());
            }))
            .build()
            .unwrap();

        client.log_line("rejected").unwrap();
        flush(&client).await;

        let dropped = dropped.lock().unwrap().clone();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].stream, "logs");
        assert_eq!(dropped[0].status, 403);
        assert_eq!(client.stream_status().logs.stats.items_dropped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shared_client_initializes_once() {
        assert!(matches!(
            shared::instance(),
            Err(ClientError::NotInitialized)
        ));

        let transport = RecordingTransport::new();
        let builder = || {
            Client::builder(test_config())
                .transport(transport.clone())
                .settings(installed_settings())
        };

        let client = shared::init_with(builder()).unwrap();
        assert!(matches!(
            shared::init_with(builder()),
            Err(ClientError::AlreadyInitialized)
        ));
        assert!(std::ptr::eq(shared::instance().unwrap(), client));
    }
}
