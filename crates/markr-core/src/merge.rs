use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{IngestError, ResultKey, TestResultCandidate, TestResultRecord};

/// Persisted access to results keyed by (student_number, test_id).
///
/// Implementations used for ingestion must see their own earlier writes, so
/// repeated keys within one document merge against the best score seen so far.
pub trait ResultRepository {
    #[allow(clippy::missing_errors_doc)]
    fn find_by_key(&self, key: &ResultKey) -> anyhow::Result<Option<TestResultRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_all_by_test_id(&self, test_id: &str) -> anyhow::Result<Vec<TestResultRecord>>;

    /// Inserts the record, or overwrites the stored one with the same key.
    /// Returns the stored record including its surrogate id.
    #[allow(clippy::missing_errors_doc)]
    fn upsert(&self, record: &TestResultRecord) -> anyhow::Result<TestResultRecord>;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MergeDecision {
    Insert(TestResultRecord),
    Update(TestResultRecord),
    Skip,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeReport {
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Best-score merge: a stored record changes only when the candidate obtained
/// strictly more marks. `marks_available` never shrinks.
#[must_use]
pub fn decide_merge(
    existing: Option<&TestResultRecord>,
    candidate: &TestResultCandidate,
    now: OffsetDateTime,
) -> MergeDecision {
    let Some(existing) = existing else {
        return MergeDecision::Insert(TestResultRecord::from_candidate(candidate, now));
    };

    if candidate.marks_obtained <= existing.marks_obtained {
        return MergeDecision::Skip;
    }

    MergeDecision::Update(TestResultRecord {
        first_name: candidate.first_name.clone(),
        last_name: candidate.last_name.clone(),
        marks_obtained: candidate.marks_obtained,
        marks_available: existing.marks_available.max(candidate.marks_available),
        scanned_at: candidate.scanned_at,
        updated_at: now,
        ..existing.clone()
    })
}

/// Applies every candidate, in order, against the repository.
///
/// Atomicity is the caller's concern: run this inside one transaction and
/// discard it when an error is returned.
///
/// # Errors
/// Returns [`IngestError::Processing`] when the repository fails.
pub fn merge_candidates<R>(
    repository: &R,
    candidates: &[TestResultCandidate],
    now: OffsetDateTime,
) -> Result<MergeReport, IngestError>
where
    R: ResultRepository + ?Sized,
{
    let mut report = MergeReport::default();

    for candidate in candidates {
        let key = candidate.key();
        let existing = repository
            .find_by_key(&key)
            .map_err(|err| IngestError::Processing(format!("{err:#}")))?;

        match decide_merge(existing.as_ref(), candidate, now) {
            MergeDecision::Insert(record) => {
                repository
                    .upsert(&record)
                    .map_err(|err| IngestError::Processing(format!("{err:#}")))?;
                tracing::debug!(%key, marks = record.marks_obtained, "inserted new result");
                report.inserted += 1;
            }
            MergeDecision::Update(record) => {
                repository
                    .upsert(&record)
                    .map_err(|err| IngestError::Processing(format!("{err:#}")))?;
                tracing::debug!(
                    %key,
                    marks = record.marks_obtained,
                    "updated result with higher score"
                );
                report.updated += 1;
            }
            MergeDecision::Skip => {
                tracing::debug!(%key, "skipped result: existing score is at least as high");
                report.skipped += 1;
            }
        }
    }

    report.processed = report.inserted + report.updated;
    Ok(report)
}
