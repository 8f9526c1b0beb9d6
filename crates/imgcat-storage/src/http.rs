//! JSON-over-HTTP client with bounded retries, used by the REST driver.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

/// Gateway overload or a 5xx; worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// The request never got a reply (connect failure, timeout, send error).
pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Retry schedule: `base_delay` doubled per retry, capped at `max_delay`, at most `max_retries` retries.
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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let mut delay = self.base_delay;
        for _ in 0..retry {
            if delay >= self.max_delay || delay.is_zero() {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(self.max_delay)
    }

    /// `None` once the retry budget is spent.
    pub fn next_delay(&self, retry: usize) -> Option<Duration> {
        (retry < self.max_retries).then(|| self.delay_for_retry(retry))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, optionally carrying `body` as JSON, and decode a JSON reply.
    ///
    /// The gateway selects the connection from the request body even on GET, so the body is
    /// sent on every attempt.
    pub async fn get_json<T>(&self, url: &str, body: Option<&Value>) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
    {
        let span = info_span!("http_fetch", url);
        async move {
            let bytes = self.get_bytes_with_retry(url, body).await?;
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }

    async fn get_bytes_with_retry(
        &self,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Vec<u8>, FetchError> {
        let mut retry = 0;
        loop {
            let mut request = self.client.get(url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let (transient, err) = match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.bytes().await?.to_vec()),
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();
                    let body = resp.text().await.unwrap_or_default();
                    (
                        is_transient_status(status),
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url,
                            body,
                        },
                    )
                }
                Err(err) => (is_transient_error(&err), FetchError::Request(err)),
            };

            match self.backoff.next_delay(retry) {
                Some(delay) if transient => {
                    warn!(retry, error = %err, "retrying gateway request");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                _ => return Err(err),
            }
        }
    }
}
