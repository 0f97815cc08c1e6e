//! Data models for the synchronization pipeline

pub mod observation;
pub mod sync_report;

pub use observation::{
    CountryCode, CoverageQuery, FetchTask, Observation, PersistedCoverage, ALL_COUNTRIES,
};
pub use sync_report::{FailureStage, IndicatorFailure, IndicatorReport, SyncOutcome, SyncPhase};
