//! JSON webhook delivery with retry classification and capped exponential backoff.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential delay doubling from `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct WebhookClient {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl WebhookClient {
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building webhook client")?;
        Ok(Self {
            client,
            url: config.url,
            backoff: config.backoff,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POSTs `body` as JSON, retrying transport errors, 5xx and 429.
    /// Returns the number of attempts used on success.
    pub async fn post_json<T: Serialize + ?Sized>(&self, body: &T) -> Result<usize, DeliveryError> {
        let span = info_span!("webhook_post", url = %self.url);
        async {
            let mut attempt = 0usize;
            loop {
                let outcome = self.client.post(&self.url).json(body).send().await;
                match outcome {
                    Ok(resp) if resp.status().is_success() => return Ok(attempt + 1),
                    Ok(resp) => {
                        let status = resp.status();
                        if classify_status(status) == RetryDisposition::NonRetryable
                            || attempt >= self.backoff.max_retries
                        {
                            return Err(DeliveryError::HttpStatus {
                                status: status.as_u16(),
                                url: resp.url().to_string(),
                            });
                        }
                        debug!(status = status.as_u16(), attempt, "retryable webhook status");
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                            || attempt >= self.backoff.max_retries
                        {
                            return Err(DeliveryError::Request(err));
                        }
                        debug!(error = %err, attempt, "retryable webhook transport error");
                    }
                }
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fast_backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    /// Serves one canned status line per incoming connection.
    async fn serve_statuses(statuses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for status in statuses {
                let (mut stream, _) = listener.accept().await.unwrap();
                read_request(&mut stream).await;
                let response =
                    format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });
        format!("http://{addr}/hook")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let url = serve_statuses(vec!["503 Service Unavailable", "200 OK"]).await;
        let mut config = WebhookConfig::new(url);
        config.backoff = fast_backoff(3);
        let client = WebhookClient::new(config).unwrap();
        let attempts = client.post_json(&serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let url = serve_statuses(vec!["400 Bad Request"]).await;
        let mut config = WebhookConfig::new(url);
        config.backoff = fast_backoff(3);
        let client = WebhookClient::new(config).unwrap();
        let err = client.post_json(&serde_json::json!([])).await.unwrap_err();
        assert!(matches!(err, DeliveryError::HttpStatus { status: 400, .. }));
    }
}
