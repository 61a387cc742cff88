//! Operation surface shared by the HTTP service and the `markr` CLI.
//!
//! [`MarkrApi`] carries only the database location. Each call opens its own
//! connection, so clones can run on any thread and concurrent calls meet only
//! in the database. Reads migrate only a store that has never been migrated.

use std::path::{Path, PathBuf};

use anyhow::Result;
use markr_core::{
    parse_test_results, AggregateStats, IngestError, MergeReport, ResultRepository,
    TestResultRecord,
};
use markr_store_sqlite::{SchemaStatus, SqliteResultStore};
use ulid::Ulid;

#[derive(Debug, Clone)]
pub struct MarkrApi {
    db_path: PathBuf,
}

impl MarkrApi {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn migrate(&self) -> Result<SchemaStatus> {
        let store = SqliteResultStore::open(&self.db_path)?;
        store.migrate()?;
        store.schema_status()
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or inspected.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteResultStore::open(&self.db_path)?.schema_status()
    }

    /// Parses an `mcq-test-results` document and merges it into the store.
    ///
    /// # Errors
    /// Returns an [`IngestError`] inside the `anyhow` error: `Validation` for
    /// malformed or invalid documents and `Processing` for storage failures.
    /// Nothing is written when an error is returned.
    pub fn import_xml(&self, xml: &[u8]) -> Result<MergeReport> {
        let import_id = Ulid::new();
        let _span = tracing::info_span!("import", %import_id, bytes = xml.len()).entered();

        let candidates = parse_test_results(xml).map_err(|err| {
            tracing::warn!(error = %err, "rejected test results document");
            IngestError::from(err)
        })?;

        let mut store = self.open_store()?;
        let report = store
            .ingest(&candidates)
            .inspect_err(|err| tracing::error!(error = %err, "error processing test results"))?;
        Ok(report)
    }

    /// # Errors
    /// Returns a [`markr_core::AggregateError`] inside the `anyhow` error when
    /// the test has no results or no available marks, or a storage error.
    pub fn aggregate(&self, test_id: &str) -> Result<AggregateStats> {
        self.open_store()?.aggregate(test_id)
    }

    /// # Errors
    /// Returns an error when the database cannot be read.
    pub fn list_results(&self, test_id: &str) -> Result<Vec<TestResultRecord>> {
        self.open_store()?.find_all_by_test_id(test_id)
    }

    fn open_store(&self) -> Result<SqliteResultStore> {
        let store = SqliteResultStore::open(&self.db_path)?;
        store.ensure_schema()?;
        Ok(store)
    }
}
