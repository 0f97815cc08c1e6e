//! Utility modules for wbsync

pub mod pool_monitor;
pub mod retry;

pub use pool_monitor::{begin_monitored, MonitoredTransaction};
pub use retry::{retry_with_backoff, RetryDecision, RetryPolicy, Retryable};
