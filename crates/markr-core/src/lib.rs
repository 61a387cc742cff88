//! Domain model and pure logic for the Markr test-result service.
//!
//! - [`parse_test_results`] turns an `mcq-test-results` XML document into
//!   validated [`TestResultCandidate`]s.
//! - [`merge_candidates`] applies the best-score merge policy through a
//!   [`ResultRepository`].
//! - [`aggregate_records`] computes [`AggregateStats`] for one test.

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

mod aggregate;
mod merge;
mod parser;
mod record;

pub use aggregate::{aggregate_records, percentile, AggregateStats};
pub use merge::{decide_merge, merge_candidates, MergeDecision, MergeReport, ResultRepository};
pub use parser::{parse_scanned_on, parse_test_results, ROOT_ELEMENT};
pub use record::{ResultKey, TestResultCandidate, TestResultRecord};

/// Failures raised while reading an XML document.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("Invalid XML syntax: {0}")]
    MalformedXml(String),
    #[error("{0}")]
    SchemaValidation(String),
}

/// Failures raised by a single ingestion call. Nothing from the call is kept
/// when one of these is returned.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IngestError {
    #[error("{0}")]
    Validation(#[from] ParseError),
    #[error("Failed to process test results: {0}")]
    Processing(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AggregateError {
    #[error("No results found for test ID: {0}")]
    NotFound(String),
    #[error("Maximum available marks is zero for test ID: {0}")]
    DegenerateInput(String),
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns the underlying parse error message when the value is not RFC3339.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns the underlying format error message.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| format!("failed to format RFC3339 timestamp: {err}"))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
