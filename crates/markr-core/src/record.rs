use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Identity of a stored result. At most one record exists per key.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ResultKey {
    pub student_number: String,
    pub test_id: String,
}

impl ResultKey {
    #[must_use]
    pub fn new(student_number: impl Into<String>, test_id: impl Into<String>) -> Self {
        Self {
            student_number: student_number.into(),
            test_id: test_id.into(),
        }
    }
}

impl Display for ResultKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "student {}, test {}", self.student_number, self.test_id)
    }
}

/// A result extracted from one `mcq-test-result` element, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TestResultCandidate {
    pub student_number: String,
    pub test_id: String,
    pub first_name: String,
    pub last_name: String,
    pub marks_obtained: u32,
    pub marks_available: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scanned_at: Option<OffsetDateTime>,
}

impl TestResultCandidate {
    #[must_use]
    pub fn key(&self) -> ResultKey {
        ResultKey::new(self.student_number.clone(), self.test_id.clone())
    }
}

/// The best-known result for one (student, test) pair.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TestResultRecord {
    pub id: i64,
    pub student_number: String,
    pub test_id: String,
    pub first_name: String,
    pub last_name: String,
    pub marks_obtained: u32,
    pub marks_available: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scanned_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TestResultRecord {
    #[must_use]
    pub fn key(&self) -> ResultKey {
        ResultKey::new(self.student_number.clone(), self.test_id.clone())
    }

    /// Builds the record a fresh candidate becomes on first ingestion. The
    /// surrogate `id` is assigned by the repository.
    #[must_use]
    pub fn from_candidate(candidate: &TestResultCandidate, now: OffsetDateTime) -> Self {
        Self {
            id: 0,
            student_number: candidate.student_number.clone(),
            test_id: candidate.test_id.clone(),
            first_name: candidate.first_name.clone(),
            last_name: candidate.last_name.clone(),
            marks_obtained: candidate.marks_obtained,
            marks_available: candidate.marks_available,
            scanned_at: candidate.scanned_at,
            created_at: now,
            updated_at: now,
        }
    }
}
