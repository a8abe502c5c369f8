//! Telemetry Shipper Library
//!
//! This library ships client telemetry to an HTTP ingestion API over two
//! independent, durable, rate-limited streams:
//!
//! - **config**: Environment-based configuration for endpoints, batching and backoff
//! - **event**: Analytics and log item types with their wire format
//! - **queue**: Single-worker FIFO executor that owns each stream's state
//! - **store**: Per-stream queue files with atomic replace
//! - **backoff**: Send interval growth after consecutive failures
//! - **transport**: HTTP POST capability and response classification
//! - **stream**: Stream definitions and the shared request envelope
//! - **sender**: Batching, retry and persistence engine for one stream
//! - **settings**: Persistent identity and flags
//! - **client**: Client handle over both streams
//!
//! # Example
//!
//! ```no_run
//! use telemetry_shipper::{AnalyticsEvent, Client, Config, TagKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Start both streams on this runtime
//!     let client = Client::new(config).expect("Failed to start client");
//!     client.set_tag(TagKind::User, Some("player-1"));
//!
//!     // Queue work; delivery happens in the background
//!     client
//!         .event(AnalyticsEvent::economy("USD", 4.99))
//!         .expect("valid economy event");
//!     client
//!         .log_line("purchase complete")
//!         .expect("non-empty log line");
//!
//!     // Wait until everything queued so far is delivered
//!     client.flush().await;
//! }
//! ```

// Module declarations
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod queue;
pub mod sender;
pub mod settings;
pub mod store;
pub mod stream;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use backoff::BackoffPolicy;
pub use client::{Client, ClientBuilder, ClientStatus, TagKind};
pub use config::{Config, ConfigError};
pub use error::{ClientError, PersistenceError, TransportError, ValidationError};
pub use event::{
    AnalyticsEvent, Economy, EventKind, LogEvent, LogLevel, MessageClick, MessageSend, Taxonomy,
};
pub use queue::{SerialTaskQueue, TaskSubmitter};
pub use sender::{DropHandler, DroppedBatch, Sender, SenderOptions, SenderStats, StreamStatus};
pub use settings::Settings;
pub use store::PersistenceStore;
pub use stream::{Envelope, EventStream, LogStream, Stream};
pub use transport::{HttpTransport, Outcome, Transport, TransportRequest, TransportResponse};
