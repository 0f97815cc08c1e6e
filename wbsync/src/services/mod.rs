//! Synchronization pipeline services

pub mod fetch_client;
pub mod gap_detector;
pub mod record_normalizer;
pub mod scheduler;
pub mod store_merger;
pub mod sync_orchestrator;

pub use fetch_client::{FetchClient, FetchError, RateLimitSnapshot};
pub use gap_detector::GapDetector;
pub use record_normalizer::{NormalizedBatch, RecordNormalizer, SkipReason};
pub use scheduler::{Scheduler, SchedulerRun, TaskReport};
pub use store_merger::{MergeReport, StoreMerger};
pub use sync_orchestrator::Synchronizer;
