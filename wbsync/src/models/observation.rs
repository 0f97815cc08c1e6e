//! Core data model: observations, coverage windows and fetch tasks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::error::SyncError;

/// Sentinel country code meaning "every country"
pub const ALL_COUNTRIES: &str = "all";

/// Country selector: one ISO-3 code or the `all` sentinel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CountryCode {
    All,
    Code(String),
}

impl CountryCode {
    /// Parse user input; codes are upper-cased, `all` matches case-insensitively
    ///
    /// Blank input yields `Ok(None)`. Anything else must be `all` or a
    /// three-character ISO-3 code, the form stored rows are keyed by.
    pub fn parse(raw: &str) -> Result<Option<Self>, SyncError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.eq_ignore_ascii_case(ALL_COUNTRIES) {
            return Ok(Some(CountryCode::All));
        }
        if trimmed.len() != 3 || !trimmed.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(SyncError::Configuration(format!(
                "country code '{}' is not an ISO-3 code",
                trimmed
            )));
        }
        Ok(Some(CountryCode::Code(trimmed.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        match self {
            CountryCode::All => ALL_COUNTRIES,
            CountryCode::Code(code) => code,
        }
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One indicator/country/year value
///
/// Key = (indicator_code, country_code, year), unique in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub indicator_code: String,
    pub country_code: String,
    pub country_name: String,
    pub year: i32,
    /// `None` when the source reported no value or an unparseable one
    pub value: Option<f64>,
    pub indicator_name: String,
    pub last_updated: DateTime<Utc>,
}

impl Observation {
    /// Storage key within the indicator's collection
    pub fn key(&self) -> (&str, i32) {
        (&self.country_code, self.year)
    }
}

/// Requested coverage window
///
/// `start_year <= end_year` is enforced by [`CoverageQuery::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageQuery {
    pub indicators: BTreeSet<String>,
    pub countries: BTreeSet<CountryCode>,
    pub start_year: i32,
    pub end_year: i32,
}

impl CoverageQuery {
    /// Validate and normalize a coverage request
    ///
    /// An empty country list, or one containing `all`, collapses to `{all}`.
    pub fn new<I, C>(
        indicators: I,
        countries: C,
        start_year: i32,
        end_year: i32,
    ) -> Result<Self, SyncError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        if start_year > end_year {
            return Err(SyncError::Configuration(format!(
                "start_year {} is after end_year {}",
                start_year, end_year
            )));
        }

        let mut indicator_set = BTreeSet::new();
        for code in indicators {
            let code = code.as_ref().trim();
            if code.is_empty() {
                return Err(SyncError::Configuration(
                    "indicator code must not be blank".to_string(),
                ));
            }
            indicator_set.insert(code.to_string());
        }

        let mut country_set = BTreeSet::new();
        for country in countries {
            if let Some(code) = CountryCode::parse(country.as_ref())? {
                country_set.insert(code);
            }
        }
        if country_set.is_empty() || country_set.contains(&CountryCode::All) {
            country_set = BTreeSet::from([CountryCode::All]);
        }

        Ok(Self {
            indicators: indicator_set,
            countries: country_set,
            start_year,
            end_year,
        })
    }

    /// True when the query targets every country
    pub fn is_all_countries(&self) -> bool {
        self.countries.contains(&CountryCode::All)
    }

    /// Explicit country codes (empty for the `all` sentinel)
    pub fn explicit_countries(&self) -> Vec<String> {
        self.countries
            .iter()
            .filter_map(|c| match c {
                CountryCode::Code(code) => Some(code.clone()),
                CountryCode::All => None,
            })
            .collect()
    }
}

/// A unit of concurrent fetch work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchTask {
    pub indicator_code: String,
    pub countries: Vec<CountryCode>,
    pub start_year: i32,
    pub end_year: i32,
}

impl FetchTask {
    /// Countries joined the way the API path expects (`USA;CAN`)
    pub fn countries_param(&self) -> String {
        self.countries
            .iter()
            .map(CountryCode::as_str)
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for FetchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}:{}",
            self.indicator_code,
            self.countries_param(),
            self.start_year,
            self.end_year
        )
    }
}

/// What is already stored for one indicator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedCoverage {
    pub indicator_code: String,
    pub pairs: HashSet<(String, i32)>,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
}

impl PersistedCoverage {
    pub fn from_pairs<I>(indicator_code: &str, pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, i32)>,
    {
        let pairs: HashSet<(String, i32)> = pairs.into_iter().collect();
        let min_year = pairs.iter().map(|(_, y)| *y).min();
        let max_year = pairs.iter().map(|(_, y)| *y).max();
        Self {
            indicator_code: indicator_code.to_string(),
            pairs,
            min_year,
            max_year,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn contains(&self, country_code: &str, year: i32) -> bool {
        self.pairs.contains(&(country_code.to_string(), year))
    }

    /// True when at least one row exists for the country
    pub fn has_country(&self, country_code: &str) -> bool {
        self.pairs.iter().any(|(c, _)| c == country_code)
    }

    /// True when any country has a row for the year
    pub fn has_year(&self, year: i32) -> bool {
        self.pairs.iter().any(|(_, y)| *y == year)
    }
}
