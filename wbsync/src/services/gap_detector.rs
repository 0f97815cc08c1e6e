//! Gap detection
//!
//! Compares a requested coverage window with what is already stored for an
//! indicator and produces the fetch tasks needed to fill it.
//!
//! # Algorithm
//! 1. Per country, missing years = window years without a stored row
//! 2. If the stored minimum year is after `start_year`, or the stored
//!    maximum year before `end_year`, the boundary years are added for
//!    every requested country
//! 3. Missing years are folded into contiguous ranges
//! 4. Countries sharing the same range become one task, split so no task
//!    carries more than `max_countries_per_task` countries
//!
//! For the `all` sentinel a year counts as stored when any country has a row
//! for it. Countries the API reports but the store has never seen are found
//! separately by [`GapDetector::detect_new_countries`].

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{CountryCode, CoverageQuery, FetchTask, PersistedCoverage};

/// Computes the minimal fetch tasks for one indicator
#[derive(Debug, Clone)]
pub struct GapDetector {
    max_countries_per_task: usize,
}

impl GapDetector {
    pub fn new(max_countries_per_task: usize) -> Self {
        Self {
            max_countries_per_task: max_countries_per_task.max(1),
        }
    }

    /// Fetch tasks needed for `indicator_code` to cover `query`
    ///
    /// Returns an empty vector when nothing is missing.
    pub fn detect(
        &self,
        indicator_code: &str,
        query: &CoverageQuery,
        coverage: &PersistedCoverage,
    ) -> Vec<FetchTask> {
        let boundary = boundary_years(query, coverage);

        // (start, end) → countries missing exactly that range
        let mut by_range: BTreeMap<(i32, i32), BTreeSet<CountryCode>> = BTreeMap::new();

        if query.is_all_countries() {
            let missing: BTreeSet<i32> = (query.start_year..=query.end_year)
                .filter(|year| !coverage.has_year(*year) || boundary.contains(year))
                .collect();
            for range in contiguous_ranges(&missing) {
                by_range.entry(range).or_default().insert(CountryCode::All);
            }
        } else {
            for country in query.explicit_countries() {
                let missing: BTreeSet<i32> = (query.start_year..=query.end_year)
                    .filter(|year| !coverage.contains(&country, *year) || boundary.contains(year))
                    .collect();
                for range in contiguous_ranges(&missing) {
                    by_range
                        .entry(range)
                        .or_default()
                        .insert(CountryCode::Code(country.clone()));
                }
            }
        }

        let mut tasks = Vec::new();
        for ((start_year, end_year), countries) in by_range {
            let countries: Vec<CountryCode> = countries.into_iter().collect();
            for chunk in countries.chunks(self.max_countries_per_task) {
                tasks.push(FetchTask {
                    indicator_code: indicator_code.to_string(),
                    countries: chunk.to_vec(),
                    start_year,
                    end_year,
                });
            }
        }

        if tasks.is_empty() {
            tracing::debug!(indicator = %indicator_code, "Coverage complete, no fetch needed");
        } else {
            tracing::info!(
                indicator = %indicator_code,
                tasks = tasks.len(),
                stored_pairs = coverage.pairs.len(),
                "Gap analysis produced fetch tasks"
            );
        }

        tasks
    }

    /// Whole-window tasks for countries the API knows but the store lacks
    ///
    /// `available` is the set of country codes seen in a recent `all` fetch.
    /// Only meaningful for the `all` sentinel; explicit country lists already
    /// name every country they want.
    pub fn detect_new_countries(
        &self,
        indicator_code: &str,
        query: &CoverageQuery,
        coverage: &PersistedCoverage,
        available: &BTreeSet<String>,
    ) -> Vec<FetchTask> {
        if !query.is_all_countries() {
            return Vec::new();
        }

        let missing: Vec<CountryCode> = available
            .iter()
            .filter(|code| !coverage.has_country(code))
            .map(|code| CountryCode::Code(code.clone()))
            .collect();

        if missing.is_empty() {
            return Vec::new();
        }

        tracing::info!(
            indicator = %indicator_code,
            new_countries = missing.len(),
            "Found countries with no stored observations"
        );

        missing
            .chunks(self.max_countries_per_task)
            .map(|chunk| FetchTask {
                indicator_code: indicator_code.to_string(),
                countries: chunk.to_vec(),
                start_year: query.start_year,
                end_year: query.end_year,
            })
            .collect()
    }
}

/// Years outside the stored [min, max] span but inside the query window
fn boundary_years(query: &CoverageQuery, coverage: &PersistedCoverage) -> BTreeSet<i32> {
    let mut years = BTreeSet::new();
    if let Some(min_year) = coverage.min_year {
        if min_year > query.start_year {
            years.extend(query.start_year..min_year.min(query.end_year + 1));
        }
    }
    if let Some(max_year) = coverage.max_year {
        if max_year < query.end_year {
            years.extend((max_year + 1).max(query.start_year)..=query.end_year);
        }
    }
    years
}

/// Fold a sorted year set into inclusive contiguous ranges
fn contiguous_ranges(years: &BTreeSet<i32>) -> Vec<(i32, i32)> {
    let mut ranges = Vec::new();
    let mut iter = years.iter().copied();

    let Some(first) = iter.next() else {
        return ranges;
    };

    let (mut start, mut end) = (first, first);
    for year in iter {
        if year == end + 1 {
            end = year;
        } else {
            ranges.push((start, end));
            start = year;
            end = year;
        }
    }
    ranges.push((start, end));

    ranges
}
