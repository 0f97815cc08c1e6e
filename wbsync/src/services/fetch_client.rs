//! Paginated indicator API client
//!
//! Retrieves every record for one (indicator, countries, year range) task:
//! `GET {base}/country/{a;b}/indicator/{code}?format=json&per_page=N&date=S:E&page=P`.
//!
//! Responses are a two-element array `[metadata, records]`. Pagination stops
//! when `page >= metadata.pages`, or on the first empty page when the
//! metadata carries no usable page count.
//!
//! Retries go through [`retry_with_backoff`]: network failures back off
//! exponentially, HTTP 429 pauses for a cooldown on its own budget, any
//! other non-2xx status fails the task at once.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use wbsync_common::config::ApiConfig;

use crate::models::CountryCode;
use crate::utils::{retry_with_backoff, RetryDecision, RetryPolicy, Retryable};

const USER_AGENT: &str = concat!("wbsync/", env!("CARGO_PKG_VERSION"));
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);
const ERROR_BODY_PREVIEW: usize = 200;

/// Fetch client errors
#[derive(Debug, Error)]
pub enum FetchError {
    /// Invalid request parameters (e.g. start_year > end_year)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection reset, timeout or similar; retried with backoff
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// HTTP 429; paused and retried on a separate budget
    #[error("Rate limited by remote API")]
    RateLimited { retry_after: Option<Duration> },

    /// Still rate limited after the pause budget was spent
    #[error("Rate limit persisted after {pauses} pauses")]
    RateLimitExceeded { pauses: u32 },

    /// Non-2xx status other than 429, or an API error envelope
    #[error("HTTP {status}: {message}")]
    NonRetryableHttp { status: u16, message: String },

    /// Body was not JSON or not the expected `[metadata, records]` shape
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Transient failures outlasted the retry budget
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    /// Run deadline or external cancellation
    #[error("Fetch cancelled")]
    Cancelled,

    /// The worker running the task panicked
    #[error("Fetch task panicked: {0}")]
    TaskPanicked(String),
}

impl Retryable for FetchError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            FetchError::TransientNetwork(_) => RetryDecision::Backoff,
            FetchError::RateLimited { retry_after } => RetryDecision::Cooldown(*retry_after),
            _ => RetryDecision::Fail,
        }
    }

    fn retries_exhausted(self, attempts: u32) -> Self {
        FetchError::MaxRetriesExceeded {
            attempts,
            last_error: self.to_string(),
        }
    }

    fn cooldowns_exhausted(self, pauses: u32) -> Self {
        FetchError::RateLimitExceeded { pauses }
    }
}

/// Pagination metadata (first element of every response)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMetadata {
    pub page: Option<u64>,
    pub pages: Option<u64>,
    pub per_page: Option<u64>,
    pub total: Option<u64>,
}

impl PageMetadata {
    /// The API sends these as numbers or numeric strings depending on endpoint
    fn from_value(value: &Value) -> Result<Self, FetchError> {
        let object = value.as_object().ok_or_else(|| {
            FetchError::MalformedResponse("metadata element is not an object".to_string())
        })?;
        Ok(Self {
            page: object.get("page").and_then(lenient_u64),
            pages: object.get("pages").and_then(lenient_u64),
            per_page: object.get("per_page").and_then(lenient_u64),
            total: object.get("total").and_then(lenient_u64),
        })
    }
}

fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// One decoded response page
#[derive(Debug, Clone)]
pub struct Page {
    pub metadata: PageMetadata,
    pub records: Vec<Value>,
}

/// Decode a response body into metadata and raw records
pub fn parse_page(body: &[u8]) -> Result<Page, FetchError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| FetchError::MalformedResponse(format!("invalid JSON: {}", e)))?;

    let elements = value.as_array().ok_or_else(|| {
        FetchError::MalformedResponse("expected a top-level array".to_string())
    })?;

    match elements.as_slice() {
        [envelope] => Err(error_envelope(envelope)),
        [metadata, records] => {
            let metadata = PageMetadata::from_value(metadata)?;
            let records = match records {
                Value::Array(items) => items.clone(),
                Value::Null => Vec::new(),
                _ => {
                    return Err(FetchError::MalformedResponse(
                        "records element is not an array".to_string(),
                    ))
                }
            };
            Ok(Page { metadata, records })
        }
        other => Err(FetchError::MalformedResponse(format!(
            "expected 2 elements, got {}",
            other.len()
        ))),
    }
}

/// `[{"message": [{"id": "120", "value": "Invalid value"}]}]`
fn error_envelope(envelope: &Value) -> FetchError {
    let text = envelope
        .get("message")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| m.get("value").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|text| !text.is_empty());

    match text {
        Some(message) => FetchError::NonRetryableHttp {
            status: 200,
            message,
        },
        None => FetchError::MalformedResponse("single-element response without message".to_string()),
    }
}

fn classify_transport_error(err: &reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Configuration(err.to_string())
    } else {
        FetchError::TransientNetwork(err.to_string())
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Counters shared by every worker talking to the same API host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub requests_sent: u64,
    pub rate_limited: u64,
    pub transient_failures: u64,
}

/// Shared pacing and rate-limit state
///
/// The token bucket paces outbound requests across workers; a 429 pause
/// only blocks the worker that received it.
pub struct RateLimitState {
    limiter: DefaultDirectRateLimiter,
    requests_sent: AtomicU64,
    rate_limited: AtomicU64,
    transient_failures: AtomicU64,
}

impl RateLimitState {
    pub fn new(requests_per_second: u32) -> Self {
        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            requests_sent: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
        }
    }

    async fn acquire(&self) {
        self.limiter.until_ready().await;
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
        }
    }
}

/// Indicator API client
///
/// Cheap to share behind an `Arc`; the underlying `reqwest::Client` pools
/// connections for the life of the run.
pub struct FetchClient {
    http_client: reqwest::Client,
    base_url: String,
    per_page: u32,
    max_pages: u32,
    policy: RetryPolicy,
    rate_limit: Arc<RateLimitState>,
}

impl FetchClient {
    pub fn new(config: &ApiConfig) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| FetchError::Configuration(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            per_page: config.per_page.max(1),
            max_pages: config.max_pages.max(1),
            policy: RetryPolicy::from_config(config),
            rate_limit: Arc::new(RateLimitState::new(config.requests_per_second)),
        })
    }

    /// Override the request timeout (sub-second values are useful in tests)
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, FetchError> {
        self.http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Configuration(e.to_string()))?;
        Ok(self)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn rate_limit_stats(&self) -> RateLimitSnapshot {
        self.rate_limit.snapshot()
    }

    /// Fetch every raw record for one indicator, country set and year range
    ///
    /// An empty `countries` slice is treated as `all`. Zero records is a
    /// valid result, not an error.
    pub async fn fetch(
        &self,
        indicator_code: &str,
        countries: &[CountryCode],
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<Value>, FetchError> {
        if start_year > end_year {
            return Err(FetchError::Configuration(format!(
                "start_year {} is after end_year {}",
                start_year, end_year
            )));
        }

        let countries_param = if countries.is_empty() {
            CountryCode::All.to_string()
        } else {
            countries
                .iter()
                .map(CountryCode::as_str)
                .collect::<Vec<_>>()
                .join(";")
        };
        let url = format!(
            "{}/country/{}/indicator/{}",
            self.base_url, countries_param, indicator_code
        );
        let date = format!("{}:{}", start_year, end_year);

        let mut records = Vec::new();
        let mut page_number: u32 = 1;

        loop {
            let operation_name = format!("fetch {} page {}", indicator_code, page_number);
            let page = retry_with_backoff(&operation_name, &self.policy, || {
                self.fetch_page(&url, &date, page_number)
            })
            .await?;

            let batch_len = page.records.len();
            records.extend(page.records);

            tracing::debug!(
                indicator = %indicator_code,
                page = page_number,
                pages = ?page.metadata.pages,
                batch = batch_len,
                "Fetched page"
            );

            if batch_len == 0 {
                break;
            }
            if let Some(pages) = page.metadata.pages.filter(|p| *p > 0) {
                if u64::from(page_number) >= pages {
                    break;
                }
            }
            if page_number >= self.max_pages {
                tracing::warn!(
                    indicator = %indicator_code,
                    max_pages = self.max_pages,
                    "Page cap reached, stopping pagination"
                );
                break;
            }
            page_number += 1;
        }

        tracing::info!(
            indicator = %indicator_code,
            countries = %countries_param,
            date = %date,
            records = records.len(),
            "Retrieved indicator data"
        );

        Ok(records)
    }

    /// Single attempt at one page
    async fn fetch_page(&self, url: &str, date: &str, page: u32) -> Result<Page, FetchError> {
        self.rate_limit.acquire().await;

        let per_page = self.per_page.to_string();
        let page_param = page.to_string();
        let response = self
            .http_client
            .get(url)
            .query(&[
                ("format", "json"),
                ("per_page", per_page.as_str()),
                ("date", date),
                ("page", page_param.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.note_transport_error(&e))?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.rate_limit.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err(FetchError::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
            return Err(FetchError::NonRetryableHttp {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.note_transport_error(&e))?;

        parse_page(&body)
    }

    fn note_transport_error(&self, err: &reqwest::Error) -> FetchError {
        let classified = classify_transport_error(err);
        if matches!(classified, FetchError::TransientNetwork(_)) {
            self.rate_limit
                .transient_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        classified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_part_page() {
        let body = br#"[
            {"page": 1, "pages": 3, "per_page": "50", "total": 120},
            [{"date": "2020", "value": 1.5}]
        ]"#;
        let page = parse_page(body).unwrap();

        assert_eq!(page.metadata.pages, Some(3));
        assert_eq!(page.metadata.per_page, Some(50));
        assert_eq!(page.records.len(), 1);
    }

    #[test]
    fn test_null_records_is_empty_page() {
        let body = br#"[{"page": 1, "pages": 0, "per_page": 50, "total": 0}, null]"#;
        let page = parse_page(body).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.metadata.total, Some(0));
    }

    #[test]
    fn test_error_envelope_is_non_retryable() {
        let body = br#"[{"message": [{"id": "120", "key": "Invalid value", "value": "The provided parameter value is not valid"}]}]"#;
        let err = parse_page(body).unwrap_err();
        assert!(matches!(err, FetchError::NonRetryableHttp { status: 200, .. }));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = parse_page(b"<html>oops</html>").unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }

    #[test]
    fn test_object_body_is_malformed() {
        let err = parse_page(br#"{"page": 1}"#).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }

    #[test]
    fn test_retry_decisions() {
        assert_eq!(
            FetchError::TransientNetwork("reset".into()).retry_decision(),
            RetryDecision::Backoff
        );
        assert_eq!(
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
            .retry_decision(),
            RetryDecision::Cooldown(Some(Duration::from_secs(2)))
        );
        assert_eq!(
            FetchError::NonRetryableHttp {
                status: 404,
                message: String::new()
            }
            .retry_decision(),
            RetryDecision::Fail
        );
    }

    #[tokio::test]
    async fn test_inverted_range_fails_before_any_request() {
        let client = FetchClient::new(&ApiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..ApiConfig::default()
        })
        .unwrap();

        let result = client
            .fetch("X", &[CountryCode::Code("USA".into())], 2021, 2020)
            .await;

        assert!(matches!(result, Err(FetchError::Configuration(_))));
        assert_eq!(client.rate_limit_stats().requests_sent, 0);
    }
}
