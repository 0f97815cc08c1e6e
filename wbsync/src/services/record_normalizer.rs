//! Raw record → Observation
//!
//! The API is loose about shapes: `indicator` and `country` arrive either as
//! `{"id": .., "value": ..}` objects or as bare strings, `value` as a number,
//! a numeric string or null. [`Label`] resolves the object-or-string union
//! once here; nothing downstream looks at raw JSON again.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::models::Observation;

/// Object-or-string field
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Entry {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        value: Option<String>,
    },
    Bare(String),
}

impl Label {
    fn id(&self) -> Option<&str> {
        match self {
            Label::Entry { id, .. } => id.as_deref(),
            Label::Bare(text) => Some(text.as_str()),
        }
        .map(str::trim)
        .filter(|s| !s.is_empty())
    }

    fn name(&self) -> Option<&str> {
        match self {
            Label::Entry { value, .. } => value.as_deref(),
            Label::Bare(text) => Some(text.as_str()),
        }
        .map(str::trim)
        .filter(|s| !s.is_empty())
    }
}

/// Wire shape of one record; `unit`, `obs_status` and `decimal` are ignored
#[derive(Debug, Deserialize)]
struct ApiRecord {
    #[serde(default)]
    indicator: Option<Label>,
    #[serde(default)]
    country: Option<Label>,
    #[serde(default)]
    countryiso3code: Option<String>,
    #[serde(default)]
    date: Option<Value>,
    #[serde(default)]
    value: Option<Value>,
}

/// Why a record was dropped from its batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Undecodable(String),
    MissingCountry,
    InvalidDate(String),
}

/// Result of normalizing one page or task worth of records
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub observations: Vec<Observation>,
    pub skipped: usize,
    /// First display name seen for the indicator
    pub indicator_name: Option<String>,
}

/// Converts raw records for one indicator
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    indicator_code: String,
    fetched_at: DateTime<Utc>,
}

impl RecordNormalizer {
    pub fn new(indicator_code: &str, fetched_at: DateTime<Utc>) -> Self {
        Self {
            indicator_code: indicator_code.to_string(),
            fetched_at,
        }
    }

    /// Normalize one record, or report why it must be skipped
    pub fn normalize(&self, raw: &Value) -> Result<Observation, SkipReason> {
        let record: ApiRecord = serde_json::from_value(raw.clone())
            .map_err(|e| SkipReason::Undecodable(e.to_string()))?;

        let indicator_name = record
            .indicator
            .as_ref()
            .and_then(Label::name)
            .unwrap_or(self.indicator_code.as_str())
            .to_string();

        let country_code = record
            .countryiso3code
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| record.country.as_ref().and_then(Label::id))
            .ok_or(SkipReason::MissingCountry)?
            .to_string();

        let country_name = record
            .country
            .as_ref()
            .and_then(Label::name)
            .unwrap_or(country_code.as_str())
            .to_string();

        let year = parse_year(record.date.as_ref())?;

        Ok(Observation {
            indicator_code: self.indicator_code.clone(),
            country_code,
            country_name,
            year,
            value: parse_value(record.value.as_ref()),
            indicator_name,
            last_updated: self.fetched_at,
        })
    }

    /// Country codes of every record that normalizes
    pub fn country_codes(&self, raw_records: &[Value]) -> BTreeSet<String> {
        raw_records
            .iter()
            .filter_map(|raw| self.normalize(raw).ok())
            .map(|observation| observation.country_code)
            .collect()
    }

    /// Normalize a batch; bad records are logged and dropped individually
    pub fn normalize_batch(&self, raw_records: &[Value]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();

        for raw in raw_records {
            match self.normalize(raw) {
                Ok(observation) => {
                    if batch.indicator_name.is_none() && observation.indicator_name != self.indicator_code {
                        batch.indicator_name = Some(observation.indicator_name.clone());
                    }
                    batch.observations.push(observation);
                }
                Err(reason) => {
                    tracing::warn!(
                        indicator = %self.indicator_code,
                        reason = ?reason,
                        "Skipping record"
                    );
                    batch.skipped += 1;
                }
            }
        }

        tracing::info!(
            indicator = %self.indicator_code,
            kept = batch.observations.len(),
            skipped = batch.skipped,
            total = raw_records.len(),
            "Normalized records"
        );

        batch
    }
}

/// Four-digit year string (or integer) → year
fn parse_year(date: Option<&Value>) -> Result<i32, SkipReason> {
    match date {
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.len() == 4 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
                trimmed
                    .parse()
                    .map_err(|_| SkipReason::InvalidDate(trimmed.to_string()))
            } else {
                Err(SkipReason::InvalidDate(trimmed.to_string()))
            }
        }
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|y| i32::try_from(y).ok())
            .filter(|y| (1000..=9999).contains(y))
            .ok_or_else(|| SkipReason::InvalidDate(n.to_string())),
        Some(other) => Err(SkipReason::InvalidDate(other.to_string())),
        None => Err(SkipReason::InvalidDate("missing".to_string())),
    }
}

/// Numeric value or explicit absence; never an error
fn parse_value(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}
