//! Observation queries
//!
//! Reads take the pool; writes take a connection so the merger can run
//! them inside one batch transaction.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use wbsync_common::time;

use crate::error::StoreError;
use crate::models::{Observation, PersistedCoverage};

type ObservationRow = (String, String, i32, Option<f64>, String, String);

/// Append `WHERE` filters for one indicator and window
///
/// An empty `countries` slice means every country.
fn push_window_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    indicator_code: &str,
    countries: &[String],
    start_year: i32,
    end_year: i32,
) {
    builder
        .push(" WHERE indicator_code = ")
        .push_bind(indicator_code.to_string())
        .push(" AND year BETWEEN ")
        .push_bind(start_year)
        .push(" AND ")
        .push_bind(end_year);

    if !countries.is_empty() {
        builder.push(" AND country_code IN (");
        let mut separated = builder.separated(", ");
        for country in countries {
            separated.push_bind(country.clone());
        }
        separated.push_unseparated(")");
    }
}

/// Stored (country, year) pairs for an indicator within a window
pub async fn load_coverage(
    pool: &SqlitePool,
    indicator_code: &str,
    countries: &[String],
    start_year: i32,
    end_year: i32,
) -> Result<PersistedCoverage, StoreError> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT country_code, year FROM observations");
    push_window_filters(&mut builder, indicator_code, countries, start_year, end_year);

    let pairs = builder
        .build_query_as::<(String, i32)>()
        .fetch_all(pool)
        .await?;

    tracing::debug!(
        indicator = %indicator_code,
        stored = pairs.len(),
        "Loaded persisted coverage"
    );

    Ok(PersistedCoverage::from_pairs(indicator_code, pairs))
}

/// Stored observations for an indicator within a window, ordered by country then year
pub async fn load_observations(
    pool: &SqlitePool,
    indicator_code: &str,
    countries: &[String],
    start_year: i32,
    end_year: i32,
) -> Result<Vec<Observation>, StoreError> {
    let mut builder = QueryBuilder::<Sqlite>::new(
        "SELECT country_code, country_name, year, value, indicator_name, last_updated FROM observations",
    );
    push_window_filters(&mut builder, indicator_code, countries, start_year, end_year);
    builder.push(" ORDER BY country_code, year");

    let rows = builder
        .build_query_as::<ObservationRow>()
        .fetch_all(pool)
        .await?;

    let observations = rows
        .into_iter()
        .map(
            |(country_code, country_name, year, value, indicator_name, last_updated)| Observation {
                indicator_code: indicator_code.to_string(),
                country_code,
                country_name,
                year,
                value,
                indicator_name,
                last_updated: time::parse_stored_timestamp(&last_updated),
            },
        )
        .collect::<Vec<_>>();

    tracing::info!(
        indicator = %indicator_code,
        records = observations.len(),
        "Retrieved stored observations"
    );

    Ok(observations)
}

/// Most recent year stored for an indicator
pub async fn latest_year(pool: &SqlitePool, indicator_code: &str) -> Result<Option<i32>, StoreError> {
    let year = sqlx::query_scalar::<_, Option<i32>>(
        "SELECT MAX(year) FROM observations WHERE indicator_code = ?",
    )
    .bind(indicator_code)
    .fetch_one(pool)
    .await?;
    Ok(year)
}

/// Number of rows stored for an indicator
pub async fn count_observations(pool: &SqlitePool, indicator_code: &str) -> Result<i64, StoreError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM observations WHERE indicator_code = ?",
    )
    .bind(indicator_code)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Stored value for one key
///
/// Outer `None`: no row. Inner `None`: row exists with an absent value.
pub async fn find_value(
    conn: &mut SqliteConnection,
    indicator_code: &str,
    country_code: &str,
    year: i32,
) -> Result<Option<Option<f64>>, sqlx::Error> {
    sqlx::query_scalar::<_, Option<f64>>(
        "SELECT value FROM observations WHERE indicator_code = ? AND country_code = ? AND year = ?",
    )
    .bind(indicator_code)
    .bind(country_code)
    .bind(year)
    .fetch_optional(conn)
    .await
}

/// Insert a new observation row
pub async fn insert_observation(
    conn: &mut SqliteConnection,
    observation: &Observation,
    indicator_name: &str,
    last_updated: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO observations (
            indicator_code, country_code, country_name, year,
            value, indicator_name, last_updated
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&observation.indicator_code)
    .bind(&observation.country_code)
    .bind(&observation.country_name)
    .bind(observation.year)
    .bind(observation.value)
    .bind(indicator_name)
    .bind(last_updated)
    .execute(conn)
    .await?;

    Ok(())
}

/// Overwrite value, indicator name and timestamp of an existing row
pub async fn update_observation_value(
    conn: &mut SqliteConnection,
    observation: &Observation,
    indicator_name: &str,
    last_updated: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE observations
        SET value = ?, indicator_name = ?, last_updated = ?
        WHERE indicator_code = ? AND country_code = ? AND year = ?
        "#,
    )
    .bind(observation.value)
    .bind(indicator_name)
    .bind(last_updated)
    .bind(&observation.indicator_code)
    .bind(&observation.country_code)
    .bind(observation.year)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}
