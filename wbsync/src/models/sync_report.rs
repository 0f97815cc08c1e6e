//! Run outcome and per-indicator statistics

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::Observation;

/// Orchestrator state machine
///
/// START → GAP_ANALYSIS → FETCHING → MERGING → ASSEMBLY → DONE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    Start,
    GapAnalysis,
    Fetching,
    Merging,
    Assembly,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Start => "START",
            SyncPhase::GapAnalysis => "GAP_ANALYSIS",
            SyncPhase::Fetching => "FETCHING",
            SyncPhase::Merging => "MERGING",
            SyncPhase::Assembly => "ASSEMBLY",
            SyncPhase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Pipeline stage at which an indicator failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Coverage,
    Fetch,
    Merge,
    Assembly,
}

/// Why one indicator could not be (fully) synchronized
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndicatorFailure {
    pub stage: FailureStage,
    pub message: String,
}

impl fmt::Display for IndicatorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.stage, self.message)
    }
}

/// Per-indicator counters collected across the run
///
/// `records_fetched == 0` means the API had no data; `records_fetched > 0`
/// with `observations_normalized == 0` means every record was dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndicatorReport {
    pub tasks_planned: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub records_fetched: usize,
    pub observations_normalized: usize,
    pub records_skipped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub item_failures: usize,
}

impl IndicatorReport {
    /// Storage writes performed for this indicator
    pub fn changes(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn display_string(&self) -> String {
        format!(
            "tasks {}/{} ok, {} fetched, {} normalized ({} skipped), {} inserted, {} updated, {} unchanged",
            self.tasks_succeeded,
            self.tasks_planned,
            self.records_fetched,
            self.observations_normalized,
            self.records_skipped,
            self.inserted,
            self.updated,
            self.unchanged
        )
    }
}

/// Everything a synchronization run produced
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    /// Stored observations per indicator for the requested window
    pub datasets: BTreeMap<String, Vec<Observation>>,
    /// indicator_code → display name
    pub indicator_names: BTreeMap<String, String>,
    /// Indicators that failed at some stage, with the reason
    pub failures: BTreeMap<String, IndicatorFailure>,
    pub reports: BTreeMap<String, IndicatorReport>,
    /// True when the run deadline or an external token cut fetching short
    pub cancelled: bool,
}

impl SyncOutcome {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            datasets: BTreeMap::new(),
            indicator_names: BTreeMap::new(),
            failures: BTreeMap::new(),
            reports: BTreeMap::new(),
            cancelled: false,
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Record a failure, keeping the earliest one per indicator
    pub fn record_failure(&mut self, indicator: &str, stage: FailureStage, message: String) {
        self.failures
            .entry(indicator.to_string())
            .or_insert(IndicatorFailure { stage, message });
    }

    pub fn report_mut(&mut self, indicator: &str) -> &mut IndicatorReport {
        self.reports.entry(indicator.to_string()).or_default()
    }
}
