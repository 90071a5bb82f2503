use futures::StreamExt;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

use crate::shutdown::ShutdownSignal;

/// Response bodies above this size are rejected.
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = concat!("gazette/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur during a single retrieval.
///
/// Use [`FetchError::kind`] to tell transient failures (worth retrying)
/// from permanent ones.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Attempt exceeded its timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Transient failures persisted through every attempt
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
    /// Shutdown was requested while the fetch was in flight
    #[error("Fetch cancelled by shutdown")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Connection failures, timeouts, 5xx and 429: retried locally, then
    /// escalated to feed backoff.
    Transient,
    /// Other 4xx, oversize bodies, malformed URLs: never retried locally.
    Permanent,
    Cancelled,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network(e) if e.is_builder() => FetchErrorKind::Permanent,
            FetchError::Network(_)
            | FetchError::Timeout
            | FetchError::IncompleteResponse { .. }
            | FetchError::Exhausted { .. } => FetchErrorKind::Transient,
            FetchError::HttpStatus(429) => FetchErrorKind::Transient,
            FetchError::HttpStatus(status) if (500..600).contains(status) => {
                FetchErrorKind::Transient
            }
            FetchError::HttpStatus(_) | FetchError::ResponseTooLarge => FetchErrorKind::Permanent,
            FetchError::Cancelled => FetchErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == FetchErrorKind::Transient
    }
}

/// Local retry schedule for one retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries. Used for best-effort side fetches.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Upper bound of the delay after the `failed_attempts`-th failure:
    /// `base_delay * 2^(failed_attempts - 1)`, capped at `max_delay`.
    pub fn ceiling(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        1u32.checked_shl(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Jittered delay: half of the ceiling is fixed, the other half random.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let ceiling = self.ceiling(failed_attempts);
        let half = ceiling / 2;
        let spread = u64::try_from((ceiling - half).as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}

/// HTTP retrieval with timeout, bounded retry and cancellation.
///
/// Cloning is cheap: the underlying `reqwest::Client` is reference counted.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    shutdown: ShutdownSignal,
}

impl Fetcher {
    pub fn new(retry: RetryPolicy, shutdown: ShutdownSignal) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self {
            client,
            retry,
            shutdown,
        })
    }

    /// Fetch `url` with the fetcher's retry policy.
    ///
    /// `timeout` bounds each attempt (request and body), not the whole call.
    ///
    /// # Errors
    ///
    /// - Permanent errors ([`FetchError::HttpStatus`] 4xx other than 429,
    ///   [`FetchError::ResponseTooLarge`]) return after the first attempt.
    /// - Transient errors are retried with jittered exponential backoff; when
    ///   attempts run out they surface as [`FetchError::Exhausted`].
    /// - [`FetchError::Cancelled`] if shutdown fires before completion.
    pub async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        self.fetch_with(url, timeout, &self.retry).await
    }

    pub async fn fetch_with(
        &self,
        url: &str,
        timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<Vec<u8>, FetchError> {
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => return Err(FetchError::Cancelled),
                result = self.attempt(url, timeout) => result,
            };

            let err = match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = retry.delay(attempt);
            tracing::warn!(
                url = %url,
                attempt = attempt,
                error = %err,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Fetch failed, retrying after delay"
            );

            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        let request = async {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }
            read_limited_bytes(response, MAX_FEED_SIZE).await
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| FetchError::Timeout)?
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if usize::try_from(len).map_or(true, |len| len > limit) {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // A connection dropped mid-body yields fewer bytes than announced
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;
    use wiremock::matchers::{any, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    fn fetcher() -> Fetcher {
        Fetcher::new(fast_retry(), ShutdownSignal::never()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let bytes = fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_fetch_404_is_permanent_without_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()), TIMEOUT)
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus(404) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }
        assert_eq!(err.kind(), FetchErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_fetch_500_retries_then_exhausts() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&mock_server)
            .await;

        let err = fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()), TIMEOUT)
            .await
            .unwrap_err();
        match &err {
            FetchError::Exhausted { attempts: 3, last } => {
                assert!(matches!(**last, FetchError::HttpStatus(500)));
            }
            e => panic!("Expected Exhausted after 3 attempts, got {:?}", e),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_429_is_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock_server)
            .await;

        let bytes = fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(bytes, b"ok");
    }

    #[tokio::test]
    async fn test_fetch_503_retry_then_success() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("third time"))
            .mount(&mock_server)
            .await;

        let bytes = fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(bytes, b"third time");
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_transient() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new(RetryPolicy::single_attempt(), ShutdownSignal::never()).unwrap();
        let err = fetcher
            .fetch(&format!("{}/feed", mock_server.uri()), Duration::from_millis(50))
            .await
            .unwrap_err();
        match &err {
            FetchError::Exhausted { attempts: 1, last } => {
                assert!(matches!(**last, FetchError::Timeout));
            }
            e => panic!("Expected exhausted timeout, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_fetch_oversize_content_length_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; MAX_FEED_SIZE + 1]))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge));
    }

    #[tokio::test]
    async fn test_fetch_cancelled_by_shutdown() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&mock_server)
            .await;

        let (trigger, signal) = shutdown_channel();
        let fetcher = Fetcher::new(fast_retry(), signal).unwrap();
        let url = format!("{}/feed", mock_server.uri());
        let handle = tokio::spawn(async move { fetcher.fetch(&url, Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("fetch should abort promptly")
            .unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(err.kind(), FetchErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_fetch_invalid_url_is_permanent() {
        let err = fetcher().fetch("not a url", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::Permanent);
    }

    #[test]
    fn test_retry_ceiling_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.ceiling(3), Duration::from_millis(350));
        assert_eq!(policy.ceiling(40), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_delay_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..=4 {
            let ceiling = policy.ceiling(attempt);
            for _ in 0..20 {
                let delay = policy.delay(attempt);
                assert!(delay >= ceiling / 2, "{:?} below half of {:?}", delay, ceiling);
                assert!(delay <= ceiling, "{:?} above {:?}", delay, ceiling);
            }
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(FetchError::HttpStatus(502).is_retryable());
        assert!(FetchError::HttpStatus(429).is_retryable());
        assert!(!FetchError::HttpStatus(403).is_retryable());
        assert!(!FetchError::HttpStatus(410).is_retryable());
        assert!(FetchError::Timeout.is_retryable());
        assert!(!FetchError::ResponseTooLarge.is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }
}
