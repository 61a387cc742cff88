use serde::{Deserialize, Serialize};

use crate::{AggregateError, TestResultRecord};

/// Summary of one test. Every statistic except `count` is a percentage of
/// the largest `marks_available` among the test's records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AggregateStats {
    pub mean: f64,
    pub count: usize,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub min: f64,
    pub max: f64,
}

/// Computes [`AggregateStats`] over the stored records of `test_id`.
///
/// # Errors
/// Returns [`AggregateError::NotFound`] for an empty record set and
/// [`AggregateError::DegenerateInput`] when no record has any marks available.
#[allow(clippy::cast_precision_loss)]
pub fn aggregate_records(
    test_id: &str,
    records: &[TestResultRecord],
) -> Result<AggregateStats, AggregateError> {
    let Some(denominator) = records.iter().map(|record| record.marks_available).max() else {
        tracing::warn!(test_id, "no results found for test");
        return Err(AggregateError::NotFound(test_id.to_string()));
    };

    if denominator == 0 {
        tracing::warn!(test_id, "maximum available marks is zero");
        return Err(AggregateError::DegenerateInput(test_id.to_string()));
    }

    let mut marks: Vec<f64> = records
        .iter()
        .map(|record| f64::from(record.marks_obtained))
        .collect();
    marks.sort_by(f64::total_cmp);

    let count = marks.len();
    let mean = marks.iter().sum::<f64>() / count as f64;
    let as_percent = |value: f64| value / f64::from(denominator) * 100.0;

    Ok(AggregateStats {
        mean: as_percent(mean),
        count,
        p25: as_percent(percentile(&marks, 25.0)),
        p50: as_percent(percentile(&marks, 50.0)),
        p75: as_percent(percentile(&marks, 75.0)),
        min: as_percent(marks[0]),
        max: as_percent(marks[count - 1]),
    })
}

/// Linear-interpolation percentile over ascending `sorted` values: the rank
/// `p / 100 * (n - 1)` is interpolated between its two neighbours.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn percentile(sorted: &[f64], percentile_rank: f64) -> f64 {
    match sorted {
        [] => 0.0,
        [only] => *only,
        _ => {
            let rank = (percentile_rank.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let fraction = rank - rank.floor();
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}
