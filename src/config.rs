//! Configuration module for the telemetry shipper.
//!
//! This module provides environment-based configuration for the client,
//! including the ingestion endpoint, storage root, batching and backoff
//! settings, and the host descriptors sent in every request envelope.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Default API URL for the ingestion service
const DEFAULT_API_URL: &str = "https://api.data-cortex.com";

/// Default batch size (number of items per POST)
const DEFAULT_BATCH_SIZE: usize = 10;

/// Maximum allowed batch size
const MAX_BATCH_SIZE: usize = 1_000;

/// Default poll interval between send checks in milliseconds
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default minimum gap between send attempts in milliseconds
const DEFAULT_MIN_SEND_INTERVAL_MS: u64 = 1_000;

/// Default backoff ceiling in milliseconds
const DEFAULT_MAX_SEND_INTERVAL_MS: u64 = 30_000;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Configuration for the telemetry client.
///
/// All settings can be configured via environment variables:
/// - `TELEMETRY_API_KEY`: API key sent in every envelope (required)
/// - `TELEMETRY_ORG`: Organization name, part of the base URL (required)
/// - `TELEMETRY_API_URL`: Ingestion host (default: https://api.data-cortex.com)
/// - `TELEMETRY_STORAGE_ROOT`: Directory for queue files (default: none)
/// - `TELEMETRY_BATCH_SIZE`: Items per POST (default: 10)
/// - `TELEMETRY_POLL_INTERVAL_MS`: Send check interval (default: 1000)
/// - `TELEMETRY_MIN_SEND_INTERVAL_MS`: Backoff floor (default: 1000)
/// - `TELEMETRY_MAX_SEND_INTERVAL_MS`: Backoff ceiling (default: 30000)
/// - `TELEMETRY_REQUEST_TIMEOUT_SECS`: HTTP timeout (default: 60)
#[derive(Debug, Clone)]
pub struct Config {
    /// API key identifying the application
    pub api_key: String,

    /// Organization name as given by the caller
    pub organization: String,

    /// Ingestion host without the organization segment
    pub api_url: String,

    /// Directory holding `{stream}.json` queue files and `settings.json`
    pub storage_root: Option<PathBuf>,

    /// Maximum number of items per outgoing batch
    pub batch_size: usize,

    /// Fixed delay before re-checking a stream that could not send
    pub poll_interval: Duration,

    /// Send interval with no recent failures
    pub min_send_interval: Duration,

    /// Upper bound for the backoff interval
    pub max_send_interval: Duration,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Version of the host application
    pub app_version: String,

    /// Operating system version string
    pub os_version: String,

    /// Two-letter language code
    pub language: String,

    /// Two-letter country code
    pub country: String,

    /// Device model description
    pub device_type: String,

    /// Device family, e.g. `desktop`
    pub device_family: String,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Create a configuration with defaults for everything except the
    /// credentials.
    pub fn new(api_key: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            organization: organization.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `TELEMETRY_API_KEY` or `TELEMETRY_ORG` is missing or empty
    /// - a numeric variable is not a valid number or exceeds limits
    /// - the maximum send interval is below the minimum
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_shipper::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Base URL: {}", config.base_url());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = Self::required("TELEMETRY_API_KEY")?;
        let organization = Self::required("TELEMETRY_ORG")?;

        let api_url = env::var("TELEMETRY_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let storage_root = env::var("TELEMETRY_STORAGE_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let batch_size = Self::parse_batch_size()?;

        let poll_interval = Duration::from_millis(Self::parse_millis(
            "TELEMETRY_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        )?);
        let min_send_interval = Duration::from_millis(Self::parse_millis(
            "TELEMETRY_MIN_SEND_INTERVAL_MS",
            DEFAULT_MIN_SEND_INTERVAL_MS,
        )?);
        let max_send_interval = Duration::from_millis(Self::parse_millis(
            "TELEMETRY_MAX_SEND_INTERVAL_MS",
            DEFAULT_MAX_SEND_INTERVAL_MS,
        )?);

        if max_send_interval < min_send_interval {
            return Err(ConfigError {
                message: format!(
                    "maximum send interval {}ms is below minimum {}ms",
                    max_send_interval.as_millis(),
                    min_send_interval.as_millis()
                ),
                env_var: Some("TELEMETRY_MAX_SEND_INTERVAL_MS".to_string()),
            });
        }

        // Load request timeout (optional, defaults to 60 seconds)
        let request_timeout_secs: u64 = env::var("TELEMETRY_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        let defaults = Self::default();
        let descriptor = |key: &str, fallback: String| env::var(key).unwrap_or(fallback);

        Ok(Self {
            api_key,
            organization,
            api_url,
            storage_root,
            batch_size,
            poll_interval,
            min_send_interval,
            max_send_interval,
            request_timeout: Duration::from_secs(request_timeout_secs),
            app_version: descriptor("TELEMETRY_APP_VERSION", defaults.app_version),
            os_version: descriptor("TELEMETRY_OS_VERSION", defaults.os_version),
            language: descriptor("TELEMETRY_LANGUAGE", defaults.language),
            country: descriptor("TELEMETRY_COUNTRY", defaults.country),
            device_type: descriptor("TELEMETRY_DEVICE_TYPE", defaults.device_type),
            device_family: descriptor("TELEMETRY_DEVICE_FAMILY", defaults.device_family),
        })
    }

    /// Base URL all stream paths are appended to.
    ///
    /// The organization is lowercased and spaces become underscores.
    pub fn base_url(&self) -> String {
        let org = self.organization.to_lowercase().replace(' ', "_");
        format!("{}/{}", self.api_url.trim_end_matches('/'), org)
    }

    /// Backoff policy derived from the send interval bounds.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.min_send_interval, self.max_send_interval)
    }

    /// Operating system name as reported in the envelope.
    pub fn os_name() -> &'static str {
        match env::consts::OS {
            "windows" => "win32",
            "macos" => "darwin",
            "linux" => "linux",
            _ => "unknown",
        }
    }

    fn required(env_var: &str) -> Result<String, ConfigError> {
        match env::var(env_var) {
            Ok(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ConfigError {
                message: "must be set".to_string(),
                env_var: Some(env_var.to_string()),
            }),
        }
    }

    /// Parse batch size from environment variable with validation.
    fn parse_batch_size() -> Result<usize, ConfigError> {
        let env_var = "TELEMETRY_BATCH_SIZE";

        match env::var(env_var) {
            Ok(value) => {
                let batch_size: usize = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if batch_size == 0 {
                    return Err(ConfigError {
                        message: "batch size must be greater than 0".to_string(),
                        env_var: Some(env_var.to_string()),
                    });
                }

                if batch_size > MAX_BATCH_SIZE {
                    return Err(ConfigError {
                        message: format!(
                            "batch size {} exceeds maximum allowed ({})",
                            batch_size, MAX_BATCH_SIZE
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(batch_size)
            }
            Err(_) => Ok(DEFAULT_BATCH_SIZE),
        }
    }

    /// Parse a millisecond interval; zero is rejected.
    fn parse_millis(env_var: &str, default: u64) -> Result<u64, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let millis: u64 = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if millis == 0 {
                    return Err(ConfigError {
                        message: "interval must be greater than 0".to_string(),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(millis)
            }
            Err(_) => Ok(default),
        }
    }
}

impl Default for Config {
    /// Create a default configuration with empty credentials.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            api_key: String::new(),
            organization: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
            storage_root: None,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            min_send_interval: Duration::from_millis(DEFAULT_MIN_SEND_INTERVAL_MS),
            max_send_interval: Duration::from_millis(DEFAULT_MAX_SEND_INTERVAL_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            app_version: "Unknown".to_string(),
            os_version: "unknown".to_string(),
            language: "en".to_string(),
            country: "US".to_string(),
            device_type: "unknown".to_string(),
            device_family: "desktop".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn credentials() -> (EnvGuard, EnvGuard) {
        (
            EnvGuard::set("TELEMETRY_API_KEY", "key-123"),
            EnvGuard::set("TELEMETRY_ORG", "My Org"),
        )
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_url, "https://api.data-cortex.com");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.min_send_interval, Duration::from_secs(1));
        assert_eq!(config.max_send_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert!(config.storage_root.is_none());
    }

    #[test]
    fn test_base_url_normalizes_organization() {
        let mut config = Config::new("key", "Big Game Studio");
        config.api_url = "http://localhost:9000/".to_string();
        assert_eq!(config.base_url(), "http://localhost:9000/big_game_studio");
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _creds = credentials();
        let _guard1 = EnvGuard::remove("TELEMETRY_API_URL");
        let _guard2 = EnvGuard::remove("TELEMETRY_BATCH_SIZE");
        let _guard3 = EnvGuard::remove("TELEMETRY_POLL_INTERVAL_MS");
        let _guard4 = EnvGuard::remove("TELEMETRY_STORAGE_ROOT");

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.api_key, "key-123");
        assert_eq!(config.base_url(), "https://api.data-cortex.com/my_org");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.storage_root.is_none());
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _creds = credentials();
        let _guard1 = EnvGuard::set("TELEMETRY_API_URL", "http://custom:9000/");
        let _guard2 = EnvGuard::set("TELEMETRY_BATCH_SIZE", "25");
        let _guard3 = EnvGuard::set("TELEMETRY_MAX_SEND_INTERVAL_MS", "5000");
        let _guard4 = EnvGuard::set("TELEMETRY_STORAGE_ROOT", "/var/lib/telemetry");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.api_url, "http://custom:9000"); // Trailing slash removed
        assert_eq!(config.base_url(), "http://custom:9000/my_org");
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_send_interval, Duration::from_secs(5));
        assert_eq!(
            config.storage_root,
            Some(PathBuf::from("/var/lib/telemetry"))
        );
    }

    #[test]
    fn test_missing_api_key() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guard1 = EnvGuard::remove("TELEMETRY_API_KEY");
        let _guard2 = EnvGuard::set("TELEMETRY_ORG", "org");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("TELEMETRY_API_KEY"));
    }

    #[test]
    fn test_invalid_batch_size() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _creds = credentials();
        let _guard = EnvGuard::set("TELEMETRY_BATCH_SIZE", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid number"));
    }

    #[test]
    fn test_zero_batch_size() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _creds = credentials();
        let _guard = EnvGuard::set("TELEMETRY_BATCH_SIZE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("greater than 0"));
    }

    #[test]
    fn test_batch_size_exceeds_max() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _creds = credentials();
        let _guard = EnvGuard::set("TELEMETRY_BATCH_SIZE", "99999");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_max_interval_below_min() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _creds = credentials();
        let _guard1 = EnvGuard::set("TELEMETRY_MIN_SEND_INTERVAL_MS", "2000");
        let _guard2 = EnvGuard::set("TELEMETRY_MAX_SEND_INTERVAL_MS", "1000");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
