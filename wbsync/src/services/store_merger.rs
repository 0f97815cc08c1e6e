//! Idempotent upsert of observations
//!
//! One batch = one indicator = one transaction. Inside the batch each
//! observation is looked up by key and inserted, updated or left alone;
//! a bad item is logged and skipped without aborting the rest.

use sqlx::SqlitePool;
use wbsync_common::time;

use crate::db::{indicator_mapping, observations};
use crate::error::StoreError;
use crate::models::Observation;
use crate::utils::begin_monitored;

/// Counts for one merged batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub item_failures: usize,
}

impl MergeReport {
    /// Rows actually written
    pub fn changes(&self) -> usize {
        self.inserted + self.updated
    }
}

enum ItemOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Writes observation batches into the store
#[derive(Clone)]
pub struct StoreMerger {
    pool: SqlitePool,
}

impl StoreMerger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Merge one indicator's observations in a single transaction
    ///
    /// The indicator display name is recorded in `indicator_mapping` in the
    /// same transaction. A commit failure aborts the whole batch and is
    /// returned as [`StoreError::Transaction`]; earlier batches stay intact.
    pub async fn merge(
        &self,
        indicator_code: &str,
        indicator_name: &str,
        batch: &[Observation],
    ) -> Result<MergeReport, StoreError> {
        let mut report = MergeReport::default();
        if batch.is_empty() {
            tracing::debug!(indicator = %indicator_code, "Empty batch, nothing to merge");
            return Ok(report);
        }

        let now = time::now().to_rfc3339();
        let mut tx = begin_monitored(&self.pool, "store_merger::merge").await?;

        // Write first: the batch must hold the write lock before its first read
        if let Err(e) =
            indicator_mapping::upsert_indicator_name(&mut **tx.inner_mut(), indicator_code, indicator_name).await
        {
            tracing::warn!(indicator = %indicator_code, error = %e, "Failed to record indicator name");
        }

        for observation in batch {
            if let Err(reason) = validate(indicator_code, observation) {
                tracing::warn!(
                    indicator = %indicator_code,
                    country = %observation.country_code,
                    year = observation.year,
                    reason,
                    "Skipping invalid observation"
                );
                report.item_failures += 1;
                continue;
            }

            match merge_one(&mut tx, observation, indicator_name, &now).await {
                Ok(ItemOutcome::Inserted) => report.inserted += 1,
                Ok(ItemOutcome::Updated) => report.updated += 1,
                Ok(ItemOutcome::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    tracing::warn!(
                        indicator = %indicator_code,
                        country = %observation.country_code,
                        year = observation.year,
                        error = %e,
                        "Failed to merge observation"
                    );
                    report.item_failures += 1;
                }
            }
        }

        tx.commit().await.map_err(|source| StoreError::Transaction {
            indicator: indicator_code.to_string(),
            source,
        })?;

        tracing::info!(
            indicator = %indicator_code,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            item_failures = report.item_failures,
            "Merged batch"
        );

        Ok(report)
    }

    /// Re-read every merged key and log the ones that are missing
    ///
    /// Returns the number of missing keys.
    pub async fn verify_batch(&self, indicator_code: &str, batch: &[Observation]) -> Result<usize, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let mut missing = 0;

        for observation in batch.iter().filter(|o| validate(indicator_code, o).is_ok()) {
            let stored =
                observations::find_value(&mut conn, indicator_code, &observation.country_code, observation.year)
                    .await?;
            if stored.is_none() {
                tracing::error!(
                    indicator = %indicator_code,
                    country = %observation.country_code,
                    year = observation.year,
                    "Merged observation not found on read-back"
                );
                missing += 1;
            }
        }

        Ok(missing)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn validate(indicator_code: &str, observation: &Observation) -> Result<(), &'static str> {
    if observation.country_code.trim().is_empty() {
        return Err("empty country code");
    }
    if observation.indicator_code != indicator_code {
        return Err("observation belongs to another indicator");
    }
    Ok(())
}

async fn merge_one(
    tx: &mut crate::utils::MonitoredTransaction,
    observation: &Observation,
    indicator_name: &str,
    now: &str,
) -> Result<ItemOutcome, sqlx::Error> {
    let existing = observations::find_value(
        &mut **tx.inner_mut(),
        &observation.indicator_code,
        &observation.country_code,
        observation.year,
    )
    .await?;

    match existing {
        None => {
            observations::insert_observation(&mut **tx.inner_mut(), observation, indicator_name, now).await?;
            tracing::debug!(
                country = %observation.country_code,
                year = observation.year,
                "Inserted observation"
            );
            Ok(ItemOutcome::Inserted)
        }
        Some(stored) if stored != observation.value => {
            observations::update_observation_value(&mut **tx.inner_mut(), observation, indicator_name, now)
                .await?;
            tracing::debug!(
                country = %observation.country_code,
                year = observation.year,
                old = ?stored,
                new = ?observation.value,
                "Updated observation"
            );
            Ok(ItemOutcome::Updated)
        }
        Some(_) => Ok(ItemOutcome::Unchanged),
    }
}
