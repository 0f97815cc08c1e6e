//! Timestamp utilities

use chrono::{DateTime, Datelike, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Calendar year of the current UTC date
pub fn current_year() -> i32 {
    Utc::now().year()
}

/// Parse an RFC 3339 timestamp as stored in the database
///
/// Falls back to the Unix epoch for unparseable input so a single bad
/// row never prevents a read-back.
pub fn parse_stored_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}
