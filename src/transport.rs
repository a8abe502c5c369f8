//! HTTP transport for batch delivery.
//!
//! A [`Transport`] performs one POST and reports either the HTTP status and
//! body or a [`TransportError`]. It never retries; the stream sender decides
//! what a result means through [`classify`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::TransportError;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// One outgoing POST.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl TransportRequest {
    /// A JSON POST that also asks for a JSON response.
    pub fn json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            headers: vec![
                ("Accept", "application/json".to_string()),
                ("Content-Type", JSON_CONTENT_TYPE.to_string()),
            ],
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// What the server answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP POST capability used by the stream senders.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport with a per-request timeout.
///
/// The underlying client is shared between streams for connection pooling.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.post(&request.url).timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }

        let response = builder.body(request.body).send().await?;
        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %request.url, status = status, error = %e, "Failed to read response body");
                String::new()
            }
        };

        debug!(url = %request.url, status = status, "POST completed");
        Ok(TransportResponse { status, body })
    }
}

/// How the sender should treat one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx; the batch is done.
    Delivered,
    /// 400, 403 or 409; resending identical bytes cannot help.
    Rejected { status: u16, reason: &'static str },
    /// Anything else; put the batch back and back off.
    Retry { reason: String },
}

/// Map a transport result onto the delivery policy.
pub fn classify(result: &Result<TransportResponse, TransportError>) -> Outcome {
    match result {
        Ok(response) if response.is_success() => Outcome::Delivered,
        Ok(response) => match response.status {
            400 => Outcome::Rejected {
                status: 400,
                reason: "bad request",
            },
            403 => Outcome::Rejected {
                status: 403,
                reason: "bad authentication, check the API key",
            },
            409 => Outcome::Rejected {
                status: 409,
                reason: "conflict, possible duplicate send",
            },
            status => Outcome::Retry {
                reason: format!("unexpected status {status}: {}", response.body),
            },
        },
        Err(TransportError::Timeout) => Outcome::Retry {
            reason: "request timed out".to_string(),
        },
        Err(e) => Outcome::Retry {
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-process transport.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Scripted reply for one request.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Reply {
        Status(u16),
        NetworkError,
        /// Never answers
        Hang,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedRequest {
        pub url: String,
        pub accept: Option<String>,
        pub body: serde_json::Value,
        pub at: Instant,
    }

    impl RecordedRequest {
        pub fn items(&self) -> &[serde_json::Value] {
            self.body["events"].as_array().map(Vec::as_slice).unwrap_or(&[])
        }
    }

    /// Records every request; replies follow a per-path script, then 200.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        scripts: Mutex<Vec<(String, VecDeque<Reply>)>>,
        requests: Mutex<Vec<RecordedRequest>>,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue replies for requests whose URL contains `path`.
        pub fn script(&self, path: &str, replies: &[Reply]) {
            self.scripts
                .lock()
                .unwrap()
                .push((path.to_string(), replies.iter().copied().collect()));
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
            self.requests()
                .into_iter()
                .filter(|r| r.url.contains(path))
                .collect()
        }

        pub fn batch_sizes(&self, path: &str) -> Vec<usize> {
            self.requests_to(path).iter().map(|r| r.items().len()).collect()
        }

        fn next_reply(&self, url: &str) -> Reply {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .iter_mut()
                .find(|(path, replies)| url.contains(path.as_str()) && !replies.is_empty())
                .and_then(|(_, replies)| replies.pop_front())
                .unwrap_or(Reply::Status(200))
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn post(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            let body = serde_json::from_slice(&request.body).unwrap_or(serde_json::Value::Null);
            self.requests.lock().unwrap().push(RecordedRequest {
                url: request.url.clone(),
                accept: request.header("accept").map(str::to_string),
                body,
                at: Instant::now(),
            });

            match self.next_reply(&request.url) {
                Reply::Status(status) => Ok(TransportResponse {
                    status,
                    body: String::new(),
                }),
                Reply::NetworkError => Err(TransportError::Other("connection refused".to_string())),
                Reply::Hang => std::future::pending().await,
            }
        }
    }
}
