//! Test Helper Utilities
//!
//! In-process mock of the indicator API plus temporary stores.

#![allow(dead_code)]

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use wbsync::services::FetchClient;
use wbsync::Synchronizer;
use wbsync_common::config::{ApiConfig, SyncConfig};

/// What the mock answers to one request
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Records served page by page, filtered by the request's date range
    Records(Vec<Value>),
    /// Non-2xx status with a plain text body
    Status(u16, String),
    /// HTTP 429, optionally with `Retry-After` seconds
    RateLimited(Option<u64>),
    /// 200 with an arbitrary body
    Raw(String),
    /// Sleep before answering with an empty result (outlasts short client timeouts)
    Slow(Duration),
}

/// One request seen by the mock
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub indicator: String,
    pub countries: String,
    pub date: String,
    pub page: u32,
}

#[derive(Default)]
struct MockState {
    // Front entries are consumed one per request; the last one is sticky
    scripts: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Mock API server bound to an ephemeral port
pub struct MockApi {
    pub base_url: String,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockApi {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/country/:countries/indicator/:code", get(serve_indicator))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            handle,
        }
    }

    /// Script the responses for one indicator
    pub fn script(&self, indicator: &str, responses: Vec<MockResponse>) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(indicator.to_string(), responses.into());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Highest number of requests the mock was serving at the same time
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn request_count(&self, indicator: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.indicator == indicator)
            .count()
    }

    /// Client settings tuned for fast tests against this mock
    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.base_url.clone(),
            per_page: 2,
            request_timeout_secs: 5,
            max_retries: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            rate_limit_cooldown_ms: 200,
            max_rate_limit_pauses: 5,
            requests_per_second: 1000,
            max_pages: 100,
        }
    }

    pub fn client(&self) -> FetchClient {
        FetchClient::new(&self.api_config()).unwrap()
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_indicator(
    State(state): State<Arc<MockState>>,
    Path((countries, indicator)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let now_serving = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now_serving, Ordering::SeqCst);
    let response = respond(&state, &countries, &indicator, &params).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    response
}

async fn respond(
    state: &MockState,
    countries: &str,
    indicator: &str,
    params: &HashMap<String, String>,
) -> Response {
    let page: u32 = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let per_page: usize = params
        .get("per_page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(50);
    let date = params.get("date").cloned().unwrap_or_default();

    state.requests.lock().unwrap().push(RecordedRequest {
        indicator: indicator.to_string(),
        countries: countries.to_string(),
        date: date.clone(),
        page,
    });

    let response = {
        let mut scripts = state.scripts.lock().unwrap();
        match scripts.get_mut(indicator) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
    };

    match response {
        None => json_response(&[page_metadata(page, 0, per_page, 0), Value::Null]),
        Some(MockResponse::Records(records)) => {
            let selected = select_records(&records, countries, &date);
            let pages = selected.len().div_ceil(per_page.max(1));
            let total = selected.len();
            let start = (page as usize).saturating_sub(1) * per_page;
            let body: Vec<Value> = selected.into_iter().skip(start).take(per_page).collect();
            json_response(&[
                page_metadata(page, pages, per_page, total),
                Value::Array(body),
            ])
        }
        Some(MockResponse::Status(code, body)) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, body).into_response()
        }
        Some(MockResponse::RateLimited(Some(secs))) => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, secs.to_string())],
            "slow down",
        )
            .into_response(),
        Some(MockResponse::RateLimited(None)) => {
            (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
        }
        Some(MockResponse::Raw(body)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Some(MockResponse::Slow(delay)) => {
            tokio::time::sleep(delay).await;
            json_response(&[page_metadata(page, 0, per_page, 0), Value::Null])
        }
    }
}

fn select_records(records: &[Value], countries: &str, date: &str) -> Vec<Value> {
    let (start, end) = date
        .split_once(':')
        .and_then(|(s, e)| Some((s.parse::<i32>().ok()?, e.parse::<i32>().ok()?)))
        .unwrap_or((i32::MIN, i32::MAX));
    let wanted: Vec<&str> = countries.split(';').collect();
    let all = wanted.iter().any(|c| c.eq_ignore_ascii_case("all"));

    records
        .iter()
        .filter(|r| {
            let year = r["date"].as_str().and_then(|d| d.parse::<i32>().ok());
            let country = r["countryiso3code"].as_str().unwrap_or_default();
            year.map_or(true, |y| (start..=end).contains(&y)) && (all || wanted.contains(&country))
        })
        .cloned()
        .collect()
}

fn page_metadata(page: u32, pages: usize, per_page: usize, total: usize) -> Value {
    json!({"page": page, "pages": pages, "per_page": per_page, "total": total})
}

fn json_response(body: &[Value]) -> Response {
    (StatusCode::OK, axum::Json(Value::Array(body.to_vec()))).into_response()
}

/// One API record in the wire shape
pub fn record(indicator: &str, iso3: &str, year: i32, value: Option<f64>) -> Value {
    json!({
        "indicator": {"id": indicator, "value": format!("{} name", indicator)},
        "country": {"id": &iso3[..2], "value": format!("{} country", iso3)},
        "countryiso3code": iso3,
        "date": year.to_string(),
        "value": value,
        "unit": "",
        "obs_status": "",
        "decimal": 0
    })
}

/// Synchronizer on a fresh temporary store, talking to `mock`
///
/// Returns (TempDir, Synchronizer) - TempDir must be kept alive for duration of test
pub async fn create_test_synchronizer(mock: &MockApi) -> (TempDir, Synchronizer) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test_wbsync.db");
    let pool = wbsync::db::init_database_pool(&db_path, 4).await.unwrap();
    let sync = Synchronizer::new(pool, mock.client(), &SyncConfig::default());
    (temp_dir, sync)
}
