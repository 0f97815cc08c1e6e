//! FetchClient behaviour against a mock API: pagination, retry, rate limits
//! and permanent failures.

mod helpers;

use helpers::{record, MockApi, MockResponse};
use serde_json::json;
use std::time::{Duration, Instant};
use wbsync::models::CountryCode;
use wbsync::services::{FetchClient, FetchError};
use wbsync::utils::RetryPolicy;
use wbsync_common::config::ApiConfig;

fn usa() -> Vec<CountryCode> {
    vec![CountryCode::Code("USA".to_string())]
}

#[tokio::test]
async fn test_follows_every_page() {
    let mock = MockApi::start().await;
    let records: Vec<_> = (2016..=2020).map(|y| record("X", "USA", y, Some(y as f64))).collect();
    mock.script("X", vec![MockResponse::Records(records)]);

    let fetched = mock.client().fetch("X", &usa(), 2016, 2020).await.unwrap();

    // per_page = 2 → pages 1, 2, 3
    assert_eq!(fetched.len(), 5);
    let pages: Vec<u32> = mock.requests().iter().map(|r| r.page).collect();
    assert_eq!(pages, vec![1, 2, 3]);
    assert!(mock.requests().iter().all(|r| r.date == "2016:2020" && r.countries == "USA"));
}

#[tokio::test]
async fn test_countries_joined_with_semicolons() {
    let mock = MockApi::start().await;
    mock.script(
        "X",
        vec![MockResponse::Records(vec![
            record("X", "USA", 2020, Some(1.0)),
            record("X", "CAN", 2020, Some(2.0)),
        ])],
    );
    let countries = vec![
        CountryCode::Code("CAN".to_string()),
        CountryCode::Code("USA".to_string()),
    ];

    let fetched = mock.client().fetch("X", &countries, 2020, 2020).await.unwrap();

    assert_eq!(fetched.len(), 2);
    assert_eq!(mock.requests()[0].countries, "CAN;USA");
}

#[tokio::test]
async fn test_unknown_page_count_stops_at_empty_page() {
    let mock = MockApi::start().await;
    let first_page = json!([
        {"page": 1, "pages": null, "per_page": 2, "total": null},
        [record("X", "USA", 2019, Some(1.0)), record("X", "USA", 2020, Some(2.0))]
    ]);
    let empty_page = json!([{"page": 2, "pages": null, "per_page": 2, "total": null}, []]);
    mock.script(
        "X",
        vec![
            MockResponse::Raw(first_page.to_string()),
            MockResponse::Raw(empty_page.to_string()),
        ],
    );

    let fetched = mock.client().fetch("X", &usa(), 2019, 2020).await.unwrap();

    assert_eq!(fetched.len(), 2);
    let pages: Vec<u32> = mock.requests().iter().map(|r| r.page).collect();
    assert_eq!(pages, vec![1, 2]);
}

#[tokio::test]
async fn test_page_cap_stops_pagination() {
    let mock = MockApi::start().await;
    let records: Vec<_> = (2011..=2020).map(|y| record("X", "USA", y, Some(y as f64))).collect();
    mock.script("X", vec![MockResponse::Records(records)]);
    let client = FetchClient::new(&ApiConfig {
        max_pages: 2,
        ..mock.api_config()
    })
    .unwrap();

    // 10 records at per_page = 2 would take 5 pages
    let fetched = client.fetch("X", &usa(), 2011, 2020).await.unwrap();

    assert_eq!(fetched.len(), 4);
    assert_eq!(mock.request_count("X"), 2);
}

#[tokio::test]
async fn test_empty_result_is_not_an_error() {
    let mock = MockApi::start().await;
    mock.script("X", vec![MockResponse::Records(Vec::new())]);

    let fetched = mock.client().fetch("X", &usa(), 2020, 2020).await.unwrap();

    assert!(fetched.is_empty());
    assert_eq!(mock.request_count("X"), 1);
}

#[tokio::test]
async fn test_recovers_after_two_timeouts() {
    let mock = MockApi::start().await;
    mock.script(
        "X",
        vec![
            MockResponse::Slow(Duration::from_millis(800)),
            MockResponse::Slow(Duration::from_millis(800)),
            MockResponse::Records(vec![record("X", "USA", 2020, Some(7.0))]),
        ],
    );
    let client = mock.client().with_timeout(Duration::from_millis(200)).unwrap();
    let max_retries = mock.api_config().max_retries as usize;

    let fetched = client.fetch("X", &usa(), 2020, 2020).await.unwrap();

    assert_eq!(fetched.len(), 1);
    let attempts = mock.request_count("X");
    assert_eq!(attempts, 3);
    assert!(attempts <= max_retries + 1);
    assert_eq!(client.rate_limit_stats().transient_failures, 2);
}

#[tokio::test]
async fn test_persistent_timeouts_exceed_retry_budget() {
    let mock = MockApi::start().await;
    mock.script("X", vec![MockResponse::Slow(Duration::from_millis(800))]);
    let policy = RetryPolicy {
        max_retries: 1,
        ..RetryPolicy::from_config(&mock.api_config())
    };
    let client = mock
        .client()
        .with_timeout(Duration::from_millis(150))
        .unwrap()
        .with_retry_policy(policy);

    let err = client.fetch("X", &usa(), 2020, 2020).await.unwrap_err();

    assert!(matches!(err, FetchError::MaxRetriesExceeded { attempts: 2, .. }));
}

#[tokio::test]
async fn test_rate_limit_pause_does_not_use_retry_budget() {
    let mock = MockApi::start().await;
    mock.script(
        "X",
        vec![
            MockResponse::RateLimited(None),
            MockResponse::Records(vec![record("X", "USA", 2020, Some(1.0))]),
        ],
    );
    let config = mock.api_config();
    let policy = RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::from_config(&config)
    };
    let client = mock.client().with_retry_policy(policy);

    let started = Instant::now();
    let fetched = client.fetch("X", &usa(), 2020, 2020).await.unwrap();

    assert_eq!(fetched.len(), 1);
    assert!(started.elapsed() >= Duration::from_millis(config.rate_limit_cooldown_ms));
    assert_eq!(client.rate_limit_stats().rate_limited, 1);
    assert_eq!(mock.request_count("X"), 2);
}

#[tokio::test]
async fn test_retry_after_header_is_honoured() {
    let mock = MockApi::start().await;
    mock.script(
        "X",
        vec![MockResponse::RateLimited(Some(1)), MockResponse::Records(Vec::new())],
    );

    let started = Instant::now();
    mock.client().fetch("X", &usa(), 2020, 2020).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_rate_limit_budget_exhausted() {
    let mock = MockApi::start().await;
    mock.script("X", vec![MockResponse::RateLimited(None)]);
    let policy = RetryPolicy {
        rate_limit_cooldown: Duration::from_millis(10),
        max_rate_limit_pauses: 2,
        ..RetryPolicy::from_config(&mock.api_config())
    };
    let client = mock.client().with_retry_policy(policy);

    let err = client.fetch("X", &usa(), 2020, 2020).await.unwrap_err();

    assert!(matches!(err, FetchError::RateLimitExceeded { pauses: 2 }));
    assert_eq!(mock.request_count("X"), 3);
}

#[tokio::test]
async fn test_not_found_fails_without_retry() {
    let mock = MockApi::start().await;
    mock.script("X", vec![MockResponse::Status(404, "no such indicator".to_string())]);

    let err = mock.client().fetch("X", &usa(), 2020, 2020).await.unwrap_err();

    match err {
        FetchError::NonRetryableHttp { status, message } => {
            assert_eq!(status, 404);
            assert!(message.contains("no such indicator"));
        }
        other => panic!("expected NonRetryableHttp, got {other:?}"),
    }
    assert_eq!(mock.request_count("X"), 1);
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let mock = MockApi::start().await;
    mock.script("X", vec![MockResponse::Status(503, "maintenance".to_string())]);

    let err = mock.client().fetch("X", &usa(), 2020, 2020).await.unwrap_err();

    assert!(matches!(err, FetchError::NonRetryableHttp { status: 503, .. }));
    assert_eq!(mock.request_count("X"), 1);
}

#[tokio::test]
async fn test_error_envelope_is_permanent() {
    let mock = MockApi::start().await;
    mock.script(
        "BAD",
        vec![MockResponse::Raw(
            r#"[{"message":[{"id":"120","key":"Invalid value","value":"The provided parameter value is not valid"}]}]"#
                .to_string(),
        )],
    );

    let err = mock.client().fetch("BAD", &usa(), 2020, 2020).await.unwrap_err();

    assert!(matches!(err, FetchError::NonRetryableHttp { status: 200, .. }));
}

#[tokio::test]
async fn test_malformed_body() {
    let mock = MockApi::start().await;
    mock.script("X", vec![MockResponse::Raw("this is not json".to_string())]);

    let err = mock.client().fetch("X", &usa(), 2020, 2020).await.unwrap_err();

    assert!(matches!(err, FetchError::MalformedResponse(_)));
    assert_eq!(mock.request_count("X"), 1);
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    // Nothing listens on the discard port
    let client = FetchClient::new(&wbsync_common::config::ApiConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        max_retries: 1,
        backoff_base_ms: 5,
        ..Default::default()
    })
    .unwrap();

    let err = client.fetch("X", &usa(), 2020, 2020).await.unwrap_err();

    assert!(matches!(err, FetchError::MaxRetriesExceeded { attempts: 2, .. }));
}
