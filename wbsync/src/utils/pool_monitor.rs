//! Connection pool monitoring utilities
//!
//! Instrumented transactions that log how long a connection was waited for
//! and how long it was held. Merge batches run inside one of these so pool
//! saturation shows up in the logs.

use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Instant;

use crate::error::StoreError;

/// Monitored transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

impl MonitoredTransaction {
    fn new(tx: Transaction<'static, Sqlite>, caller: &'static str, acquired_at: Instant) -> Self {
        Self {
            tx: Some(tx),
            caller,
            acquired_at,
        }
    }

    /// Commit the transaction and log release timing
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        let held_ms = self.acquired_at.elapsed().as_millis() as u64;
        let tx = self.tx.take().expect("Transaction already consumed");

        tx.commit().await?;

        if held_ms > 2000 {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                "LONG TRANSACTION - Connection held for extended period"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms, "Connection released (commit)");
        }

        Ok(())
    }

    /// Get a mutable reference to the inner transaction
    pub fn inner_mut(&mut self) -> &mut Transaction<'static, Sqlite> {
        self.tx.as_mut().expect("Transaction already consumed")
    }
}

impl Drop for MonitoredTransaction {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let held_ms = self.acquired_at.elapsed().as_millis() as u64;
            tracing::warn!(
                caller = self.caller,
                held_ms,
                "Transaction dropped without commit, rolled back"
            );
        }
    }
}

/// Begin a monitored transaction with connection pool timing logs
///
/// # Example
/// ```ignore
/// let mut tx = begin_monitored(&pool, "store_merger::merge").await?;
/// // ... use transaction ...
/// tx.commit().await?;
/// ```
pub async fn begin_monitored(
    pool: &SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction, StoreError> {
    let start = Instant::now();

    tracing::debug!(caller, "Connection acquisition requested");

    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis() as u64;
    if wait_ms > 1000 {
        tracing::warn!(
            caller,
            wait_ms,
            "SLOW CONNECTION ACQUISITION - Pool may be saturated (all connections in use)"
        );
    } else {
        tracing::debug!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction::new(tx, caller, Instant::now()))
}
