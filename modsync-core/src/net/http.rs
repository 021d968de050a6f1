//! HTTP client with rate-limit handling
//!
//! [`HttpClient`] wraps an [`HttpTransport`] and applies the request policy:
//! 200/204 are success, 401 maps to [`HttpError::Unauthorized`], and 429 is
//! retried up to [`MAX_RATE_LIMIT_RETRIES`] times, sleeping for the server's
//! `Retry-After` or for a linearly growing delay.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AlwaysOnline, Connectivity, HttpError};
use crate::sync::{NoProgress, ProgressListener};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Upper bound on a whole request, which also bounds writes
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries granted to a 429 response before giving up
pub const MAX_RATE_LIMIT_RETRIES: u32 = 5;

static SECRET_PARAMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(token|device_id|client_id)=[^&]*").expect("secret param pattern is valid")
});

/// Raw response as seen by the transport
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Lowercased header names
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// `Retry-After` in seconds, if present and numeric
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// One GET round-trip, no policy applied
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Fetch `url`. Only network-level failures are errors; any status is Ok.
    async fn get(&self, url: &str, progress: &dyn ProgressListener)
        -> Result<HttpResponse, HttpError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HttpError::Transport {
                url: String::new(),
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        progress: &dyn ProgressListener,
    ) -> Result<HttpResponse, HttpError> {
        let transport_error = |e: reqwest::Error| HttpError::Transport {
            url: hide_token(url),
            message: e.to_string(),
        };

        let mut response = self.client.get(url).send().await.map_err(transport_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let total = response.content_length().unwrap_or(0);
        let mut body = Vec::with_capacity(total.min(64 * 1024 * 1024) as usize);
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            body.extend_from_slice(&chunk);
            progress.on_progress(clamp_u32(body.len() as u64), clamp_u32(total));
        }
        progress.on_progress(clamp_u32(body.len() as u64), clamp_u32(body.len() as u64));

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn clamp_u32(value: u64) -> u32 {
    value.min(u32::MAX as u64) as u32
}

/// Shared HTTP entry point for every network consumer
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
    connectivity: Arc<dyn Connectivity>,
}

impl HttpClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            connectivity: Arc::new(AlwaysOnline),
        }
    }

    /// Client over reqwest with the standard timeout budget
    pub fn with_user_agent(user_agent: &str) -> Result<Self, HttpError> {
        Ok(Self::new(Arc::new(ReqwestTransport::new(user_agent)?)))
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn has_connectivity(&self) -> bool {
        self.connectivity.is_online()
    }

    pub async fn get(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        self.get_with_progress(url, &NoProgress).await
    }

    pub async fn get_string(&self, url: &str) -> Result<String, HttpError> {
        let body = self.get(url).await?;
        String::from_utf8(body).map_err(|e| HttpError::Decode {
            url: hide_token(url),
            message: e.to_string(),
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HttpError> {
        let body = self.get(url).await?;
        serde_json::from_slice(&body).map_err(|e| HttpError::Decode {
            url: hide_token(url),
            message: e.to_string(),
        })
    }

    /// GET with progress and the status/rate-limit policy applied
    pub async fn get_with_progress(
        &self,
        url: &str,
        progress: &dyn ProgressListener,
    ) -> Result<Vec<u8>, HttpError> {
        if !self.has_connectivity() {
            return Err(HttpError::Offline);
        }

        let mut retries = 0u32;
        loop {
            let response = self.transport.get(url, progress).await?;
            match response.status {
                200 | 204 => return Ok(response.body),
                401 => {
                    return Err(HttpError::Unauthorized {
                        url: hide_token(url),
                    })
                }
                429 if retries < MAX_RATE_LIMIT_RETRIES => {
                    retries += 1;
                    let delay = response
                        .retry_after()
                        .unwrap_or_else(|| backoff_delay(retries));
                    warn!(
                        "Rate limited by {} (attempt {}), sleeping {:?}",
                        hide_token(url),
                        retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                429 => {
                    return Err(HttpError::RateLimited {
                        url: hide_token(url),
                        attempts: retries + 1,
                    })
                }
                status => {
                    debug!("Failed to fetch {} with code {}", hide_token(url), status);
                    return Err(HttpError::Status {
                        status,
                        url: hide_token(url),
                    });
                }
            }
        }
    }
}

/// Linear back-off: one second per attempt
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt))
}

/// Redact credentials from a URL before it reaches a log line
pub fn hide_token(url: &str) -> String {
    SECRET_PARAMS.replace_all(url, "$1=<hidden>").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned responses and records when each request happened
    struct Scripted {
        responses: Mutex<Vec<HttpResponse>>,
        calls: Mutex<Vec<tokio::time::Instant>>,
    }

    impl Scripted {
        fn new(mut responses: Vec<HttpResponse>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn get(
            &self,
            _url: &str,
            _progress: &dyn ProgressListener,
        ) -> Result<HttpResponse, HttpError> {
            self.calls.lock().unwrap().push(tokio::time::Instant::now());
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| HttpResponse::with_status(429)))
        }
    }

    #[tokio::test]
    async fn test_success() {
        let transport = Scripted::new(vec![HttpResponse::ok("hello")]);
        let client = HttpClient::new(transport);
        assert_eq!(client.get_string("https://x.test/a").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let transport = Scripted::new(vec![HttpResponse::with_status(401)]);
        let client = HttpClient::new(transport);
        let err = client.get("https://x.test/a?token=secret").await.unwrap_err();
        assert_eq!(
            err,
            HttpError::Unauthorized {
                url: "https://x.test/a?token=<hidden>".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_other_status_is_error() {
        let transport = Scripted::new(vec![HttpResponse::with_status(500)]);
        let client = HttpClient::new(transport);
        let err = client.get("https://x.test/a").await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backs_off_then_gives_up() {
        let transport = Scripted::new(Vec::new());
        let client = HttpClient::new(transport.clone());

        let err = client.get("https://x.test/a").await.unwrap_err();
        assert!(matches!(err, HttpError::RateLimited { attempts: 6, .. }));

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 6);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] > pair[0], "sleeps must strictly increase: {gaps:?}");
        }
        assert_eq!(gaps[0], Duration::from_secs(1));
        assert_eq!(gaps[4], Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honours_retry_after() {
        let mut limited = HttpResponse::with_status(429);
        limited
            .headers
            .insert("retry-after".to_string(), "7".to_string());
        let transport = Scripted::new(vec![limited, HttpResponse::ok("done")]);
        let client = HttpClient::new(transport.clone());

        assert_eq!(client.get("https://x.test/a").await.unwrap(), b"done");
        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls[1] - calls[0], Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_offline_short_circuits() {
        let transport = Scripted::new(vec![HttpResponse::ok("unused")]);
        let online = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let client = HttpClient::new(transport.clone()).with_connectivity(online);

        assert_eq!(client.get("https://x.test/a").await, Err(HttpError::Offline));
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_hide_token() {
        assert_eq!(
            hide_token("https://api.test/x?token=abc&v=1&device_id=dev&client_id=cli"),
            "https://api.test/x?token=<hidden>&v=1&device_id=<hidden>&client_id=<hidden>"
        );
    }
}
