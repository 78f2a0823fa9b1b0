//! Audience filters and their validation.
//!
//! A filter must be validated before it reaches the analytical source: an unbounded or
//! overly wide date range would turn a candidate query into a scan of the whole lead table.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{AudienceResult, ErrorKind};
use crate::types::CandidateRecord;

/// Longest creation date range a filter may span.
pub const MAX_FILTER_SPAN_DAYS: i64 = 366;

/// Criteria selecting the requests that belong to an audience.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceFilter {
    /// Inclusive lower bound of the request creation date. Required.
    pub creation_date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound of the request creation date. Defaults to the evaluation time.
    pub creation_date_to: Option<DateTime<Utc>>,
    /// Accepted request statuses. Empty accepts any status.
    #[serde(default)]
    pub statuses: BTreeSet<String>,
    #[serde(default)]
    pub rejection_reasons: BTreeSet<String>,
    #[serde(default)]
    pub non_target_reasons: BTreeSet<String>,
}

/// Validated, closed creation date range of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.from <= instant && instant <= self.to
    }
}

impl AudienceFilter {
    /// Validates the filter at evaluation time `now` and returns its effective date range.
    ///
    /// Fails with [`ErrorKind::InvalidFilter`] when the lower bound is missing, when the
    /// bounds are inverted, or when the range spans more than [`MAX_FILTER_SPAN_DAYS`] days.
    pub fn validate(&self, now: DateTime<Utc>) -> AudienceResult<DateRange> {
        let Some(from) = self.creation_date_from else {
            bail!(
                ErrorKind::InvalidFilter,
                "Filter has no creation date lower bound"
            );
        };
        let to = self.creation_date_to.unwrap_or(now);

        if from > to {
            bail!(
                ErrorKind::InvalidFilter,
                "Filter creation date range is inverted",
                format!("creation_date_from {from} is after creation_date_to {to}")
            );
        }

        if to - from > TimeDelta::days(MAX_FILTER_SPAN_DAYS) {
            bail!(
                ErrorKind::InvalidFilter,
                "Filter creation date range is too wide",
                format!(
                    "range {from} .. {to} spans more than {MAX_FILTER_SPAN_DAYS} days"
                )
            );
        }

        Ok(DateRange { from, to })
    }

    /// Returns the union of rejection and non-target reasons.
    ///
    /// Both kinds of reason live in the same column of the analytical source.
    pub fn reasons(&self) -> BTreeSet<&str> {
        self.rejection_reasons
            .iter()
            .chain(self.non_target_reasons.iter())
            .map(String::as_str)
            .collect()
    }

    /// Returns whether `record` satisfies the filter within `range`.
    pub fn matches(&self, range: &DateRange, record: &CandidateRecord) -> bool {
        if !range.contains(record.created_at) {
            return false;
        }

        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }

        let reasons = self.reasons();
        if !reasons.is_empty() {
            return record
                .reason
                .as_deref()
                .is_some_and(|reason| reasons.contains(reason));
        }

        true
    }
}
