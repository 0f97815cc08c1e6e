//! Synchronization run orchestrator
//!
//! Drives one run through its phases:
//!
//! START → GAP_ANALYSIS → FETCHING/MERGING → ASSEMBLY → DONE
//!
//! Fetching and merging overlap: each task's records are normalized and
//! committed as soon as that task finishes, so a cancelled run keeps
//! everything merged up to that point. Only a store that cannot be opened
//! fails the run; every other failure is recorded against its indicator.

use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wbsync_common::config::{SyncConfig, TomlConfig};
use wbsync_common::time;

use crate::db::{self, indicator_mapping, observations};
use crate::error::{SyncError, SyncResult};
use crate::models::{CountryCode, CoverageQuery, FailureStage, FetchTask, PersistedCoverage, SyncOutcome, SyncPhase};
use crate::services::fetch_client::{FetchClient, FetchError};
use crate::services::gap_detector::GapDetector;
use crate::services::record_normalizer::RecordNormalizer;
use crate::services::scheduler::{Scheduler, TaskReport};
use crate::services::store_merger::StoreMerger;

/// Connections kept by the run's pool
const POOL_CONNECTIONS: u32 = 4;

/// Years before `end_year` scanned when looking for new countries
const DISCOVERY_LOOKBACK_YEARS: i32 = 1;

/// Owns the store pool and API client for the lifetime of a run
pub struct Synchronizer {
    pool: SqlitePool,
    client: Arc<FetchClient>,
    merger: StoreMerger,
    gap_detector: GapDetector,
    run_deadline: Option<Duration>,
}

impl Synchronizer {
    /// Open the store and build the API client
    ///
    /// A store that cannot be opened is the one run-fatal error.
    pub async fn connect(config: &TomlConfig, db_path: &Path) -> SyncResult<Self> {
        config.validate()?;

        let pool = db::init_database_pool(db_path, POOL_CONNECTIONS).await?;
        let client = FetchClient::new(&config.api).map_err(|e| SyncError::Configuration(e.to_string()))?;

        Ok(Self::new(pool, client, &config.sync))
    }

    /// Assemble from an already opened pool and client
    pub fn new(pool: SqlitePool, client: FetchClient, sync_config: &SyncConfig) -> Self {
        Self {
            merger: StoreMerger::new(pool.clone()),
            pool,
            client: Arc::new(client),
            gap_detector: GapDetector::new(sync_config.max_countries_per_task),
            run_deadline: sync_config.run_deadline_secs.map(Duration::from_secs),
        }
    }

    pub fn with_run_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.run_deadline = deadline;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn client(&self) -> &FetchClient {
        &self.client
    }

    /// Synchronize and return the stored datasets for the requested window
    pub async fn synchronize<I, C>(
        &self,
        indicator_codes: I,
        country_codes: C,
        start_year: i32,
        end_year: i32,
        concurrency_limit: usize,
    ) -> SyncResult<SyncOutcome>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        self.synchronize_with_cancel(
            indicator_codes,
            country_codes,
            start_year,
            end_year,
            concurrency_limit,
            CancellationToken::new(),
        )
        .await
    }

    /// [`Self::synchronize`] with an external cancellation token
    ///
    /// The configured run deadline still applies on top of `cancel`.
    pub async fn synchronize_with_cancel<I, C>(
        &self,
        indicator_codes: I,
        country_codes: C,
        start_year: i32,
        end_year: i32,
        concurrency_limit: usize,
        cancel: CancellationToken,
    ) -> SyncResult<SyncOutcome>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        if concurrency_limit == 0 {
            return Err(SyncError::Configuration(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        let query = CoverageQuery::new(indicator_codes, country_codes, start_year, end_year)?;

        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut outcome = SyncOutcome::new(run_id);

        let run_token = cancel.child_token();
        let deadline_timer = self.run_deadline.map(|deadline| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        tracing::warn!(deadline_secs = deadline.as_secs(), "Run deadline reached, cancelling fetches");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        log_phase(run_id, SyncPhase::Start);
        tracing::info!(
            %run_id,
            indicators = query.indicators.len(),
            countries = ?query.countries,
            start_year = query.start_year,
            end_year = query.end_year,
            concurrency_limit,
            "Synchronization started"
        );

        // Known display names; fetched records may refine them
        let mut names = match indicator_mapping::get_all_indicator_names(&self.pool).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read indicator names, falling back to codes");
                HashMap::new()
            }
        };

        let tasks = self.plan(&query, &run_token, &mut outcome).await;

        self.fetch_and_merge(tasks, concurrency_limit, &run_token, &mut names, &mut outcome)
            .await;

        log_phase(run_id, SyncPhase::Assembly);
        self.assemble(&query, &names, &mut outcome).await;

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        log_phase(run_id, SyncPhase::Done);
        let stats = self.client.rate_limit_stats();
        tracing::info!(
            %run_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            datasets = outcome.datasets.len(),
            failures = outcome.failures.len(),
            cancelled = outcome.cancelled,
            requests_sent = stats.requests_sent,
            rate_limited = stats.rate_limited,
            transient_failures = stats.transient_failures,
            "Synchronization finished"
        );

        Ok(outcome)
    }

    /// Coverage read and gap analysis for every requested indicator
    async fn plan(&self, query: &CoverageQuery, cancel: &CancellationToken, outcome: &mut SyncOutcome) -> Vec<FetchTask> {
        let countries = query.explicit_countries();
        let mut coverages = Vec::with_capacity(query.indicators.len());

        for indicator in &query.indicators {
            outcome.report_mut(indicator);
            match observations::load_coverage(&self.pool, indicator, &countries, query.start_year, query.end_year)
                .await
            {
                Ok(coverage) => coverages.push(coverage),
                Err(e) => {
                    tracing::error!(indicator = %indicator, error = %e, "Failed to read persisted coverage");
                    outcome.record_failure(indicator, FailureStage::Coverage, e.to_string());
                }
            }
        }

        log_phase(outcome.run_id, SyncPhase::GapAnalysis);

        let mut tasks = Vec::new();
        for coverage in &coverages {
            let mut indicator_tasks = self.gap_detector.detect(&coverage.indicator_code, query, coverage);
            if let Some(available) = self.discover_countries(query, coverage, cancel, outcome).await {
                indicator_tasks.extend(self.gap_detector.detect_new_countries(
                    &coverage.indicator_code,
                    query,
                    coverage,
                    &available,
                ));
            }
            outcome.report_mut(&coverage.indicator_code).tasks_planned = indicator_tasks.len();
            tasks.extend(indicator_tasks);
        }

        tasks
    }

    /// Countries the API reports for the most recent years of the window
    ///
    /// Only runs for the `all` sentinel over a non-empty store; an empty store
    /// fetches the whole window anyway. A failed lookup is recorded against the
    /// indicator and planning goes on without it.
    async fn discover_countries(
        &self,
        query: &CoverageQuery,
        coverage: &PersistedCoverage,
        cancel: &CancellationToken,
        outcome: &mut SyncOutcome,
    ) -> Option<BTreeSet<String>> {
        if !query.is_all_countries() || coverage.is_empty() {
            return None;
        }

        let indicator = coverage.indicator_code.as_str();
        let recent_start = (query.end_year - DISCOVERY_LOOKBACK_YEARS).max(query.start_year);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.client.fetch(indicator, &[CountryCode::All], recent_start, query.end_year) => result,
        };

        match result {
            Ok(records) => {
                let available = RecordNormalizer::new(indicator, time::now()).country_codes(&records);
                tracing::debug!(
                    indicator = %indicator,
                    available = available.len(),
                    start_year = recent_start,
                    end_year = query.end_year,
                    "Scanned recent data for new countries"
                );
                Some(available)
            }
            Err(err) => {
                if matches!(err, FetchError::Cancelled) {
                    outcome.cancelled = true;
                }
                tracing::warn!(indicator = %indicator, error = %err, "New-country scan failed");
                outcome.record_failure(indicator, FailureStage::Fetch, format!("new-country scan: {}", err));
                None
            }
        }
    }

    /// Run fetch tasks and merge each one as it completes
    async fn fetch_and_merge(
        &self,
        tasks: Vec<FetchTask>,
        concurrency_limit: usize,
        cancel: &CancellationToken,
        names: &mut HashMap<String, String>,
        outcome: &mut SyncOutcome,
    ) {
        if tasks.is_empty() {
            tracing::info!(run_id = %outcome.run_id, "Store already covers the request, nothing to fetch");
            return;
        }

        log_phase(outcome.run_id, SyncPhase::Fetching);
        let scheduler = Scheduler::new(Arc::clone(&self.client), concurrency_limit);
        let mut run = scheduler.spawn(tasks, cancel.clone());
        let mut merging_started = false;

        while let Some(TaskReport { task, result, .. }) = run.next_report().await {
            let indicator = task.indicator_code.as_str();

            let records = match result {
                Ok(records) => records,
                Err(err) => {
                    if matches!(err, FetchError::Cancelled) {
                        outcome.cancelled = true;
                    }
                    outcome.report_mut(indicator).tasks_failed += 1;
                    outcome.record_failure(indicator, FailureStage::Fetch, format!("{}: {}", task, err));
                    continue;
                }
            };

            if !merging_started {
                log_phase(outcome.run_id, SyncPhase::Merging);
                merging_started = true;
            }

            let batch = RecordNormalizer::new(indicator, time::now()).normalize_batch(&records);
            {
                let report = outcome.report_mut(indicator);
                report.tasks_succeeded += 1;
                report.records_fetched += records.len();
                report.observations_normalized += batch.observations.len();
                report.records_skipped += batch.skipped;
            }

            if let Some(name) = &batch.indicator_name {
                names.insert(indicator.to_string(), name.clone());
            }
            let indicator_name = names.get(indicator).cloned().unwrap_or_else(|| indicator.to_string());

            match self.merger.merge(indicator, &indicator_name, &batch.observations).await {
                Ok(merged) => {
                    let report = outcome.report_mut(indicator);
                    report.inserted += merged.inserted;
                    report.updated += merged.updated;
                    report.unchanged += merged.unchanged;
                    report.item_failures += merged.item_failures;

                    if let Err(e) = self.merger.verify_batch(indicator, &batch.observations).await {
                        tracing::warn!(indicator = %indicator, error = %e, "Read-back verification failed");
                    }
                }
                Err(e) => {
                    tracing::error!(indicator = %indicator, task = %task, error = %e, "Merge failed");
                    outcome.record_failure(indicator, FailureStage::Merge, e.to_string());
                }
            }
        }

        if cancel.is_cancelled() {
            outcome.cancelled = true;
        }
    }

    /// Re-read the store for the full requested window
    async fn assemble(&self, query: &CoverageQuery, names: &HashMap<String, String>, outcome: &mut SyncOutcome) {
        let countries = query.explicit_countries();

        for indicator in &query.indicators {
            match observations::load_observations(&self.pool, indicator, &countries, query.start_year, query.end_year)
                .await
            {
                Ok(dataset) => {
                    outcome.datasets.insert(indicator.clone(), dataset);
                }
                Err(e) => {
                    tracing::error!(indicator = %indicator, error = %e, "Failed to assemble dataset");
                    outcome.record_failure(indicator, FailureStage::Assembly, e.to_string());
                }
            }

            let name = match names.get(indicator) {
                Some(name) => name.clone(),
                None => indicator_mapping::get_indicator_name(&self.pool, indicator)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| indicator.clone()),
            };
            outcome.indicator_names.insert(indicator.clone(), name);
        }

        for (indicator, report) in &outcome.reports {
            tracing::info!(indicator = %indicator, "{}", report.display_string());
        }
    }

    /// Close the pool at the end of the run
    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn log_phase(run_id: Uuid, phase: SyncPhase) {
    tracing::info!(%run_id, %phase, "Sync phase");
}
