//! indicator_code → display name mapping

use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use wbsync_common::time;

use crate::error::StoreError;

/// Record the display name for an indicator
///
/// An unchanged name leaves the row untouched.
pub async fn upsert_indicator_name(
    conn: &mut SqliteConnection,
    code: &str,
    name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO indicator_mapping (code, name, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(code) DO UPDATE SET
            name = excluded.name,
            updated_at = excluded.updated_at
        WHERE indicator_mapping.name <> excluded.name
        "#,
    )
    .bind(code)
    .bind(name)
    .bind(time::now().to_rfc3339())
    .execute(conn)
    .await?;

    Ok(())
}

/// Display name for one indicator, if recorded
pub async fn get_indicator_name(pool: &SqlitePool, code: &str) -> Result<Option<String>, StoreError> {
    let name = sqlx::query_scalar::<_, String>("SELECT name FROM indicator_mapping WHERE code = ?")
        .bind(code)
        .fetch_optional(pool)
        .await?;
    Ok(name)
}

/// Display names for every recorded indicator
pub async fn get_all_indicator_names(pool: &SqlitePool) -> Result<HashMap<String, String>, StoreError> {
    let rows = sqlx::query_as::<_, (String, String)>("SELECT code, name FROM indicator_mapping")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().collect())
}
