//! Paginated source-API client for the remote CMS collections.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, warn};
use wpm_core::SourceRecord;

pub const CRATE_NAME: &str = "wpm-source";

/// Fixed page size the collection API is polled with.
pub const PAGE_SIZE: usize = 100;

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

/// Bounded exponential backoff. Replaces the old sleep-5s-retry-forever
/// loop on 429s: exceeding `max_retries` is an explicit failure.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl SourceClientConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("retries exhausted after {attempts} attempts for {url}")]
    RetriesExhausted { attempts: usize, url: String },
    #[error("decoding items page: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(default)]
    items: Vec<SourceRecord>,
}

/// Client for the bearer-token collection API. One instance per run.
#[derive(Debug)]
pub struct SourceClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl SourceClient {
    pub fn new(config: SourceClientConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            config.api_token
        ))
        .context("building authorization header")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    fn page_url(&self, collection_id: &str, offset: usize) -> String {
        format!(
            "{}/collections/{}/items?limit={}&offset={}",
            self.base_url, collection_id, PAGE_SIZE, offset
        )
    }

    /// Fetch every item in a collection via offset pagination. The whole
    /// list is materialized since reconciliation needs random access.
    /// Any non-retryable error aborts the fetch; no partial salvage.
    pub async fn fetch_all(&self, collection_id: &str) -> Result<Vec<SourceRecord>, FetchError> {
        let span = info_span!("fetch_all", collection_id);
        let _guard = span.enter();

        fetch_all_pages(PAGE_SIZE, |offset| {
            let url = self.page_url(collection_id, offset);
            async move {
                let page = self.fetch_page(&url).await?;
                debug!(offset, count = page.items.len(), "fetched items page");
                Ok(page.items)
            }
        })
        .await
    }

    async fn fetch_page(&self, url: &str) -> Result<ItemsPage, FetchError> {
        retry_with_backoff(&self.backoff, url, || async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(AttemptFailure::from_request)?;
            let status = resp.status();
            if status.is_success() {
                let body = resp.bytes().await.map_err(AttemptFailure::from_request)?;
                return serde_json::from_slice(&body).map_err(|err| AttemptFailure {
                    disposition: RetryDisposition::NonRetryable,
                    error: FetchError::Decode(err),
                });
            }
            Err(AttemptFailure {
                disposition: classify_status(status),
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                },
            })
        })
        .await
    }
}

/// Offset-paginated collection loop: request pages of `page_size` until a
/// short page signals the end. Errors abort immediately, nothing partial
/// is returned.
async fn fetch_all_pages<F, Fut>(
    page_size: usize,
    mut fetch: F,
) -> Result<Vec<SourceRecord>, FetchError>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<SourceRecord>, FetchError>>,
{
    let mut records = Vec::new();
    let mut offset = 0usize;

    loop {
        let page = fetch(offset).await?;
        let count = page.len();
        records.extend(page);
        if count < page_size {
            break;
        }
        offset += page_size;
    }

    Ok(records)
}

/// One failed attempt: what went wrong, and whether it is worth retrying.
#[derive(Debug)]
struct AttemptFailure {
    disposition: RetryDisposition,
    error: FetchError,
}

impl AttemptFailure {
    fn from_request(err: reqwest::Error) -> Self {
        Self {
            disposition: classify_reqwest_error(&err),
            error: FetchError::Request(err),
        }
    }
}

/// Retry an attempt under the backoff policy. Retryable failures sleep
/// and try again up to the ceiling, then surface `RetriesExhausted`;
/// non-retryable failures propagate as-is.
async fn retry_with_backoff<T, F, Fut>(
    backoff: &BackoffPolicy,
    url: &str,
    mut attempt: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AttemptFailure>>,
{
    for index in 0..=backoff.max_retries {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(failure) => {
                if failure.disposition == RetryDisposition::NonRetryable {
                    return Err(failure.error);
                }
                if index < backoff.max_retries {
                    let delay = backoff.delay_for_attempt(index);
                    warn!(
                        attempt = index,
                        delay_ms = delay.as_millis() as u64,
                        url,
                        error = %failure.error,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(FetchError::RetriesExhausted {
        attempts: backoff.max_retries + 1,
        url: url.to_string(),
    })
}
