//! HTTP fetch client for the upstream publisher, with bounded concurrency and
//! capped exponential backoff on transient failures.
//!
//! The AMFI portal sometimes answers `200 OK` with an HTML maintenance page or
//! an empty body instead of the text file, and the daily file is large enough
//! that a dropped connection can cut the body short. Both count as transient.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Transport failures, including a body that stopped mid-download.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// `Some(reason)` when a successful response does not carry a data payload.
pub fn unusable_body_reason(body: &str) -> Option<&'static str> {
    let head = body.trim_start();
    if head.is_empty() {
        return Some("empty body");
    }
    let prefix = head.get(..9).unwrap_or(head).to_ascii_lowercase();
    if prefix.starts_with("<!doctype") || prefix.starts_with("<html") {
        return Some("html page instead of data");
    }
    None
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let secs = resp.headers().get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Exponential delay for `attempt_index`, raised to the server's
    /// `Retry-After` hint when that is longer, and capped at `max_delay`.
    pub fn delay_for(&self, attempt_index: usize, hint: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor);
        exponential.max(hint.unwrap_or_default()).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unusable response from {url}: {reason}")]
    UnusableBody { url: String, reason: &'static str },
    #[error("fetcher is shutting down")]
    Closed,
}

/// One failed attempt and whether it is worth repeating.
struct Failure {
    error: FetchError,
    disposition: RetryDisposition,
    retry_after: Option<Duration>,
}

impl Failure {
    fn transport(err: reqwest::Error) -> Self {
        Self {
            disposition: classify_reqwest_error(&err),
            error: FetchError::Request(err),
            retry_after: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query` and return the body as text, retrying transient
    /// failures according to the backoff policy.
    pub async fn fetch_text(
        &self,
        label: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", label, url);
        self.fetch_with_retries(url, query).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let failure = match self.attempt(url, query).await {
                Ok(fetched) => return Ok(fetched),
                Err(failure) => failure,
            };
            if failure.disposition == RetryDisposition::NonRetryable
                || attempt >= self.backoff.max_retries
            {
                return Err(failure.error);
            }
            let delay = self.backoff.delay_for(attempt, failure.retry_after);
            warn!(error = %failure.error, attempt, ?delay, "transient upstream failure");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, Failure> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(Failure::transport)?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(Failure {
                disposition: classify_status(status),
                retry_after: retry_after(&resp),
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
            });
        }

        let body = resp.text().await.map_err(Failure::transport)?;
        if let Some(reason) = unusable_body_reason(&body) {
            return Err(Failure {
                error: FetchError::UnusableBody {
                    url: final_url,
                    reason,
                },
                disposition: RetryDisposition::Retryable,
                retry_after: None,
            });
        }
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const NAV_BODY: &str = "Scheme Code;ISIN Div Payout/ ISIN Growth;ISIN Div Reinvestment;\
Scheme Name;Net Asset Value;Date\n119551;INF209KA12Z1;;Alpha Fund;105.1;05-Jan-2024\n";

    fn http_response(status: &str, content_type: &str, extra: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\n{extra}content-length: {}\r\n\
connection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Answers one connection per canned response, in order, then stops
    /// listening so any further attempt fails to connect.
    async fn canned_upstream(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        format!("http://{addr}/spages/NAVAll.txt")
    }

    fn fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("mfnav-test".into()),
            max_concurrency: 1,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .unwrap()
    }

    #[test]
    fn backoff_is_exponential_capped_and_honours_retry_after() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(40, None), Duration::from_millis(350));
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(120))),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn portal_timeouts_and_outages_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn html_and_blank_payloads_are_not_data() {
        assert_eq!(
            unusable_body_reason("\r\n<!DOCTYPE html><html><body>Maintenance</body></html>"),
            Some("html page instead of data")
        );
        assert_eq!(unusable_body_reason("<HTML>"), Some("html page instead of data"));
        assert_eq!(unusable_body_reason("  \n"), Some("empty body"));
        assert_eq!(unusable_body_reason(NAV_BODY), None);
        assert_eq!(unusable_body_reason("Scheme Code,Scheme Name\n"), None);
    }

    #[tokio::test]
    async fn maintenance_page_and_outage_are_retried_until_nav_text_arrives() {
        let url = canned_upstream(vec![
            http_response(
                "200 OK",
                "text/html",
                "",
                "<html><body>Under maintenance</body></html>",
            ),
            http_response("503 Service Unavailable", "text/plain", "retry-after: 0\r\n", ""),
            http_response("200 OK", "text/plain", "", NAV_BODY),
        ])
        .await;

        let fetched = fetcher(3)
            .fetch_text("nav_daily", &url, &[("t", "05012024213000".to_string())])
            .await
            .unwrap();
        assert_eq!(fetched.status, StatusCode::OK);
        assert!(fetched.final_url.contains("t=05012024213000"));
        assert_eq!(fetched.body, NAV_BODY);
    }

    #[tokio::test]
    async fn persistent_maintenance_page_surfaces_as_unusable_body() {
        let page = http_response("200 OK", "text/html", "", "<!doctype html><p>down</p>");
        let url = canned_upstream(vec![page.clone(), page]).await;

        let err = fetcher(1).fetch_text("nav_daily", &url, &[]).await.unwrap_err();
        match err {
            FetchError::UnusableBody { reason, .. } => {
                assert_eq!(reason, "html page instead of data")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_report_is_not_retried() {
        let missing = http_response("404 Not Found", "text/plain", "", "no");
        let url = canned_upstream(vec![missing]).await;

        let err = fetcher(3).fetch_text("nav_history", &url, &[]).await.unwrap_err();
        assert!(
            matches!(err, FetchError::HttpStatus { status: 404, .. }),
            "unexpected error: {err}"
        );
    }
}
