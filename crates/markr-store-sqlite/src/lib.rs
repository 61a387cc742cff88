#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use markr_core::{
    aggregate_records, format_rfc3339, merge_candidates, now_utc, parse_rfc3339_utc,
    AggregateStats, IngestError, MergeReport, ResultKey, ResultRepository, TestResultCandidate,
    TestResultRecord,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;

const RESULTS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RESULTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS test_results (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  student_number TEXT NOT NULL CHECK (length(student_number) > 0),
  test_id TEXT NOT NULL CHECK (length(test_id) > 0),
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  marks_obtained INTEGER NOT NULL CHECK (marks_obtained >= 0),
  marks_available INTEGER NOT NULL CHECK (marks_available >= 0),
  scanned_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CONSTRAINT uix_student_test UNIQUE (student_number, test_id)
);

CREATE INDEX IF NOT EXISTS idx_test_results_test_id
  ON test_results(test_id);
";

const RECORD_COLUMNS: &str = "id, student_number, test_id, first_name, last_name,
    marks_obtained, marks_available, scanned_at, created_at, updated_at";

pub struct SqliteResultStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteResultStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RESULTS_V1)
            .context("failed to apply test_results schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RESULTS_MIGRATION_VERSION, now],
            )
            .context("failed to register test_results schema migration")?;

        Ok(())
    }

    /// Migrates only when a version is pending. A store that is already
    /// current is left untouched, so readers never take the write lock.
    pub fn ensure_schema(&self) -> Result<SchemaStatus> {
        let status = self.schema_status()?;
        if status.pending_versions.is_empty() {
            return Ok(status);
        }

        self.migrate()?;
        self.schema_status()
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let has_migrations_table: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = 'schema_migrations'
                 )",
                [],
                |row| row.get(0),
            )
            .context("failed to inspect sqlite_master")?;

        let current_version = if has_migrations_table {
            self.conn
                .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
                    row.get(0)
                })
                .context("failed to read schema_migrations")?
        } else {
            0
        };

        let pending_versions = (current_version + 1..=RESULTS_MIGRATION_VERSION).collect();
        Ok(SchemaStatus {
            current_version,
            target_version: RESULTS_MIGRATION_VERSION,
            pending_versions,
        })
    }

    /// Merges candidates into the store as one IMMEDIATE transaction.
    ///
    /// The write lock is taken before the first read, so concurrent ingestions
    /// touching the same key run one after another and the best score wins
    /// regardless of interleaving. Any error rolls back the whole call.
    pub fn ingest(
        &mut self,
        candidates: &[TestResultCandidate],
    ) -> Result<MergeReport, IngestError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| {
                IngestError::Processing(format!("failed to start ingest transaction: {err}"))
            })?;

        let report = merge_candidates(&ConnectionRepository(&tx), candidates, now_utc())?;

        tx.commit().map_err(|err| {
            IngestError::Processing(format!("failed to commit ingest transaction: {err}"))
        })?;

        tracing::info!(
            processed = report.processed,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "successfully processed test results"
        );
        Ok(report)
    }

    /// Summary statistics for one test. The typed
    /// [`markr_core::AggregateError`] is preserved inside the returned error.
    pub fn aggregate(&self, test_id: &str) -> Result<AggregateStats> {
        let records = self.find_all_by_test_id(test_id)?;
        Ok(aggregate_records(test_id, &records)?)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl ResultRepository for SqliteResultStore {
    fn find_by_key(&self, key: &ResultKey) -> Result<Option<TestResultRecord>> {
        ConnectionRepository(&self.conn).find_by_key(key)
    }

    fn find_all_by_test_id(&self, test_id: &str) -> Result<Vec<TestResultRecord>> {
        ConnectionRepository(&self.conn).find_all_by_test_id(test_id)
    }

    fn upsert(&self, record: &TestResultRecord) -> Result<TestResultRecord> {
        ConnectionRepository(&self.conn).upsert(record)
    }
}

/// Repository over a borrowed connection; a `Transaction` derefs to one.
struct ConnectionRepository<'conn>(&'conn Connection);

impl ResultRepository for ConnectionRepository<'_> {
    fn find_by_key(&self, key: &ResultKey) -> Result<Option<TestResultRecord>> {
        self.0
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM test_results
                     WHERE student_number = ?1 AND test_id = ?2"
                ),
                params![key.student_number, key.test_id],
                parse_record_row,
            )
            .optional()
            .with_context(|| format!("failed to look up result for {key}"))
    }

    fn find_all_by_test_id(&self, test_id: &str) -> Result<Vec<TestResultRecord>> {
        let mut stmt = self.0.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM test_results
             WHERE test_id = ?1
             ORDER BY student_number ASC"
        ))?;
        let rows = stmt.query_map(params![test_id], parse_record_row)?;
        collect_rows(rows).with_context(|| format!("failed to list results for test {test_id}"))
    }

    fn upsert(&self, record: &TestResultRecord) -> Result<TestResultRecord> {
        self.0
            .query_row(
                &format!(
                    "INSERT INTO test_results(
                        student_number, test_id, first_name, last_name,
                        marks_obtained, marks_available, scanned_at, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(student_number, test_id) DO UPDATE SET
                       first_name = excluded.first_name,
                       last_name = excluded.last_name,
                       marks_obtained = excluded.marks_obtained,
                       marks_available = excluded.marks_available,
                       scanned_at = excluded.scanned_at,
                       updated_at = excluded.updated_at
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![
                    record.student_number,
                    record.test_id,
                    record.first_name,
                    record.last_name,
                    i64::from(record.marks_obtained),
                    i64::from(record.marks_available),
                    record.scanned_at.map(format_timestamp).transpose()?,
                    format_timestamp(record.created_at)?,
                    format_timestamp(record.updated_at)?,
                ],
                parse_record_row,
            )
            .with_context(|| format!("failed to upsert result for {}", record.key()))
    }
}

fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err))
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestResultRecord> {
    let scanned_at_raw: Option<String> = row.get(7)?;
    let created_at_raw: String = row.get(8)?;
    let updated_at_raw: String = row.get(9)?;

    Ok(TestResultRecord {
        id: row.get(0)?,
        student_number: row.get(1)?,
        test_id: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        marks_obtained: parse_marks(row, 5)?,
        marks_available: parse_marks(row, 6)?,
        scanned_at: scanned_at_raw
            .as_deref()
            .map(|raw| parse_rfc3339_utc(raw).map_err(|err| to_sql_error(7, err)))
            .transpose()?,
        created_at: parse_rfc3339_utc(&created_at_raw).map_err(|err| to_sql_error(8, err))?,
        updated_at: parse_rfc3339_utc(&updated_at_raw).map_err(|err| to_sql_error(9, err))?,
    })
}

fn parse_marks(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(index)?;
    u32::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid marks value: {value}"),
            )),
        )
    })
}

fn to_sql_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use markr_core::AggregateError;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_ingest(
        store: &mut SqliteResultStore,
        candidates: &[TestResultCandidate],
    ) -> MergeReport {
        match store.ingest(candidates) {
            Ok(report) => report,
            Err(err) => panic!("ingest failed: {err}"),
        }
    }

    fn fixture_store() -> SqliteResultStore {
        let store = must(SqliteResultStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("markr-store-{}.sqlite3", ulid::Ulid::new()))
    }

    fn candidate(
        student_number: &str,
        test_id: &str,
        obtained: u32,
        available: u32,
    ) -> TestResultCandidate {
        TestResultCandidate {
            student_number: student_number.to_string(),
            test_id: test_id.to_string(),
            first_name: format!("First{obtained}"),
            last_name: "Student".to_string(),
            marks_obtained: obtained,
            marks_available: available,
            scanned_at: None,
        }
    }

    fn stored(store: &SqliteResultStore, student_number: &str, test_id: &str) -> TestResultRecord {
        match must(store.find_by_key(&ResultKey::new(student_number, test_id))) {
            Some(record) => record,
            None => panic!("missing stored record for {student_number}/{test_id}"),
        }
    }

    fn count_rows(store: &SqliteResultStore) -> i64 {
        match store
            .connection()
            .query_row("SELECT COUNT(*) FROM test_results", [], |row| row.get(0))
        {
            Ok(count) => count,
            Err(err) => panic!("failed to count rows: {err}"),
        }
    }

    #[test]
    fn migrate_is_idempotent_and_reports_current_version() {
        let store = fixture_store();
        must(store.migrate());

        let status = must(store.schema_status());
        assert_eq!(status.current_version, RESULTS_MIGRATION_VERSION);
        assert!(status.pending_versions.is_empty());
    }

    #[test]
    fn schema_status_reports_pending_before_migration() {
        let store = must(SqliteResultStore::open(Path::new(":memory:")));
        let status = must(store.schema_status());
        assert_eq!(status.current_version, 0);
        assert_eq!(status.pending_versions, vec![RESULTS_MIGRATION_VERSION]);
    }

    #[test]
    fn ensure_schema_migrates_fresh_store_once() {
        let store = must(SqliteResultStore::open(Path::new(":memory:")));
        let status = must(store.ensure_schema());
        assert!(status.pending_versions.is_empty());
        assert_eq!(must(store.ensure_schema()), status);
    }

    #[test]
    fn ensure_schema_on_current_store_does_not_wait_for_writers() {
        let db_path = unique_temp_db_path();
        must(must(SqliteResultStore::open(&db_path)).migrate());

        let mut writer = must(SqliteResultStore::open(&db_path));
        let held = match writer.conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(err) => panic!("failed to hold write lock: {err}"),
        };

        let reader = must(SqliteResultStore::open(&db_path));
        let started = std::time::Instant::now();
        let status = must(reader.ensure_schema());
        assert!(status.pending_versions.is_empty());
        assert!(must(reader.find_all_by_test_id("t1")).is_empty());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));

        drop(held);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn ingest_inserts_then_keeps_best_score() {
        let mut store = fixture_store();

        let first = must_ingest(&mut store, &[candidate("1", "t1", 10, 20)]);
        assert_eq!(first.processed, 1);
        let original = stored(&store, "1", "t1");

        let lower = must_ingest(&mut store, &[candidate("1", "t1", 8, 30)]);
        assert_eq!(lower.processed, 0);
        assert_eq!(stored(&store, "1", "t1"), original);

        let higher = must_ingest(&mut store, &[candidate("1", "t1", 15, 18)]);
        assert_eq!(higher.processed, 1);
        let updated = stored(&store, "1", "t1");
        assert_eq!(updated.id, original.id);
        assert_eq!(updated.marks_obtained, 15);
        assert_eq!(updated.marks_available, 20);
        assert_eq!(updated.first_name, "First15");
        assert_eq!(updated.created_at, original.created_at);
        assert!(updated.updated_at >= original.updated_at);
        assert_eq!(count_rows(&store), 1);
    }

    #[test]
    fn scanned_at_round_trips_through_storage() {
        let mut store = fixture_store();
        let mut scanned = candidate("1", "t1", 10, 20);
        scanned.scanned_at =
            Some(must(parse_rfc3339_utc("2017-12-04T01:12:10Z").map_err(|err| anyhow!(err))));

        must_ingest(&mut store, &[scanned.clone()]);
        assert_eq!(stored(&store, "1", "t1").scanned_at, scanned.scanned_at);
    }

    #[test]
    fn failed_ingest_rolls_back_every_change_from_the_call() {
        let mut store = fixture_store();
        must_ingest(&mut store, &[candidate("1", "t1", 10, 20)]);

        let result = store.ingest(&[
            candidate("1", "t1", 19, 20),
            candidate("2", "t1", 12, 20),
            candidate("", "t1", 5, 20),
        ]);
        assert!(matches!(result, Err(IngestError::Processing(_))), "unexpected: {result:?}");

        assert_eq!(stored(&store, "1", "t1").marks_obtained, 10);
        assert!(must(store.find_by_key(&ResultKey::new("2", "t1"))).is_none());
        assert_eq!(count_rows(&store), 1);
    }

    #[test]
    fn find_all_by_test_id_only_returns_that_test() {
        let mut store = fixture_store();
        must_ingest(
            &mut store,
            &[
                candidate("2", "t1", 10, 20),
                candidate("1", "t1", 12, 20),
                candidate("1", "t2", 3, 5),
            ],
        );

        let records = must(store.find_all_by_test_id("t1"));
        let students: Vec<&str> =
            records.iter().map(|record| record.student_number.as_str()).collect();
        assert_eq!(students, vec!["1", "2"]);
        assert!(must(store.find_all_by_test_id("missing")).is_empty());
    }

    #[test]
    fn aggregate_reads_stored_marks() {
        let mut store = fixture_store();
        must_ingest(
            &mut store,
            &[
                candidate("1", "t1", 15, 20),
                candidate("2", "t1", 18, 20),
                candidate("3", "t1", 12, 20),
                candidate("4", "t1", 20, 20),
                candidate("5", "t1", 10, 20),
            ],
        );

        let stats = must(store.aggregate("t1"));
        assert_eq!(stats.count, 5);
        assert!((stats.mean - 75.0).abs() < 0.0001);
        assert!((stats.p25 - 60.0).abs() < 0.0001);
        assert!((stats.p75 - 90.0).abs() < 0.0001);
    }

    #[test]
    fn aggregate_preserves_typed_errors() {
        let mut store = fixture_store();
        must_ingest(&mut store, &[candidate("1", "zero", 0, 0)]);

        let missing = match store.aggregate("missing") {
            Ok(stats) => panic!("expected not found, got {stats:?}"),
            Err(err) => err,
        };
        assert_eq!(
            missing.downcast_ref::<AggregateError>(),
            Some(&AggregateError::NotFound("missing".to_string()))
        );

        let degenerate = match store.aggregate("zero") {
            Ok(stats) => panic!("expected degenerate input, got {stats:?}"),
            Err(err) => err,
        };
        assert_eq!(
            degenerate.downcast_ref::<AggregateError>(),
            Some(&AggregateError::DegenerateInput("zero".to_string()))
        );
    }

    #[test]
    fn concurrent_ingestions_keep_the_highest_score() {
        let db_path = unique_temp_db_path();
        must(must(SqliteResultStore::open(&db_path)).migrate());

        std::thread::scope(|scope| {
            for worker in 0..4_u32 {
                let db_path = db_path.clone();
                scope.spawn(move || {
                    let mut store = must(SqliteResultStore::open(&db_path));
                    for round in 0..25_u32 {
                        let obtained = (round * 7 + worker * 13) % 100;
                        must_ingest(&mut store, &[candidate("1", "race", obtained, 100)]);
                    }
                });
            }
        });

        let expected = (0..4_u32)
            .flat_map(|worker| (0..25_u32).map(move |round| (round * 7 + worker * 13) % 100))
            .max()
            .unwrap_or_default();
        let store = must(SqliteResultStore::open(&db_path));
        assert_eq!(stored(&store, "1", "race").marks_obtained, expected);
        assert_eq!(count_rows(&store), 1);

        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn stored_marks_equal_per_key_maximum(
            entries in prop::collection::vec((0_u8..4, 0_u32..50, 1_u32..60), 1..30)
        ) {
            let mut store = fixture_store();
            let candidates: Vec<TestResultCandidate> = entries
                .iter()
                .map(|(student, obtained, available)| {
                    candidate(&student.to_string(), "prop", *obtained, *available)
                })
                .collect();

            must_ingest(&mut store, &candidates);

            let mut expected: BTreeMap<String, u32> = BTreeMap::new();
            for item in &candidates {
                let best = expected.entry(item.student_number.clone()).or_insert(0);
                *best = (*best).max(item.marks_obtained);
            }

            let records = must(store.find_all_by_test_id("prop"));
            prop_assert_eq!(records.len(), expected.len());
            for record in &records {
                prop_assert_eq!(Some(&record.marks_obtained), expected.get(&record.student_number));
            }

            let before = records;
            let second = must_ingest(&mut store, &candidates);
            prop_assert_eq!(second.processed, 0);
            prop_assert_eq!(must(store.find_all_by_test_id("prop")), before);
        }
    }
}
