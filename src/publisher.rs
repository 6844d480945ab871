//! Partitioned publisher
//!
//! Publishes one accumulated table in two phases: a partitioned write through a
//! [`DatasetSink`] followed by registration of the table definition in a
//! [`SchemaCatalog`]. The catalog phase only runs once the write succeeded.
//! Each phase reports its own [`PhaseOutcome`].

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn};

use crate::accumulator::PARTICIPANT_FULL_ID_COLUMN;
use crate::catalog::{SchemaCatalog, TableDefinition};
use crate::error::IngestError;
use crate::storage::DatasetSink;
use crate::types::{duration_millis, PhaseOutcome, PublishMode, RowSet, TablePublishReport};

/// Bounded exponential backoff for transient storage and catalog failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Run `op`, retrying while it fails with a transient error
    pub fn run<T>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> Result<T, IngestError>,
    ) -> Result<T, IngestError> {
        let mut attempt = 1;
        let mut backoff = self.initial_backoff;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = backoff.min(self.max_backoff);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    thread::sleep(delay);
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// One table to publish
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub rows: &'a RowSet,
    /// Canonical table name
    pub table: &'a str,
    pub database: &'a str,
    /// Partition columns, `participant_full_id` first
    pub partition_cols: &'a [String],
    pub mode: PublishMode,
}

/// Writes tables to a sink and registers them in a catalog
#[derive(Clone)]
pub struct Publisher {
    sink: Arc<dyn DatasetSink>,
    catalog: Arc<dyn SchemaCatalog>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(sink: Arc<dyn DatasetSink>, catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self {
            sink,
            catalog,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Publish one table; never fails, outcomes are reported per phase
    pub fn publish(&self, request: &PublishRequest<'_>) -> TablePublishReport {
        let started = Instant::now();
        let rows = request.rows.num_rows();
        let span = info_span!("publish", table = request.table, rows);
        let _enter = span.enter();

        let (storage, catalog) = if rows == 0 {
            (
                PhaseOutcome::Skipped("no rows".to_string()),
                PhaseOutcome::Skipped("no rows".to_string()),
            )
        } else {
            let written = self.conform(request).and_then(|conformed| {
                let request = PublishRequest {
                    rows: &conformed,
                    ..*request
                };
                let location = self.write(&request)?;
                Ok((conformed, location))
            });
            match written {
                Ok((conformed, location)) => {
                    let request = PublishRequest {
                        rows: &conformed,
                        ..*request
                    };
                    (PhaseOutcome::Success, self.register(&request, &location))
                }
                Err(e) => (
                    PhaseOutcome::Failure(e.to_string()),
                    PhaseOutcome::Skipped("storage write failed".to_string()),
                ),
            }
        };

        let elapsed = started.elapsed();
        let report = TablePublishReport {
            table: request.table.to_string(),
            rows,
            storage,
            catalog,
            elapsed,
        };
        if report.storage.is_failure() || report.catalog.is_failure() {
            warn!(
                storage = %report.storage,
                catalog = %report.catalog,
                elapsed_ms = elapsed.as_millis() as u64,
                "Table publish failed"
            );
        } else {
            info!(
                storage = %report.storage,
                catalog = %report.catalog,
                elapsed_ms = elapsed.as_millis() as u64,
                "Table published"
            );
        }
        report
    }

    /// Rows converted to the registered column types of an appended table
    ///
    /// Files already in the dataset keep their types, so incoming columns must
    /// convert to them; a column that cannot is a schema mismatch and nothing
    /// is written.
    fn conform<'r>(&self, request: &PublishRequest<'r>) -> Result<Cow<'r, RowSet>, IngestError> {
        if request.mode == PublishMode::Overwrite {
            return Ok(Cow::Borrowed(request.rows));
        }
        let existing = self
            .retry
            .run("catalog lookup", || {
                self.catalog.get_table(request.database, request.table)
            })?;
        let definition = match existing {
            Some(definition) => definition,
            None => return Ok(Cow::Borrowed(request.rows)),
        };

        let mut rows = request.rows.clone();
        rows.conform_to(&definition.column_types()?)
            .map_err(|reason| IngestError::SchemaMismatch {
                table: request.table.to_string(),
                reason,
            })?;
        Ok(Cow::Owned(rows))
    }

    fn write(&self, request: &PublishRequest<'_>) -> Result<String, IngestError> {
        if request.partition_cols.first().map(String::as_str) != Some(PARTICIPANT_FULL_ID_COLUMN) {
            return Err(IngestError::StorageWrite {
                table: request.table.to_string(),
                reason: format!("partition columns must start with '{}'", PARTICIPANT_FULL_ID_COLUMN),
            });
        }
        if let Some(missing) = request
            .partition_cols
            .iter()
            .find(|col| request.rows.column(col.as_str()).is_none())
        {
            return Err(IngestError::Configuration(format!(
                "partition column '{}' is not a column of table '{}'; \
                 every --partition-by column must exist in every published table",
                missing, request.table
            )));
        }

        let summary = self
            .retry
            .run("storage write", || {
                self.sink.write_partitioned(
                    request.rows,
                    request.table,
                    request.partition_cols,
                    request.mode,
                )
            })
            .map_err(|e| match e {
                e @ IngestError::StorageWrite { .. } => e,
                other => IngestError::StorageWrite {
                    table: request.table.to_string(),
                    reason: other.to_string(),
                },
            })?;

        info!(
            location = %summary.location,
            partitions = summary.partitions,
            files = summary.files.len(),
            "Dataset written"
        );
        Ok(summary.location)
    }

    fn register(&self, request: &PublishRequest<'_>, location: &str) -> PhaseOutcome {
        let definition = TableDefinition::from_rows(
            request.database,
            request.table,
            location,
            request.rows,
            request.partition_cols,
        );

        let result = self.retry.run("catalog update", || {
            self.catalog.upsert_table(definition.clone(), request.mode)
        });
        match result {
            Ok(change) => {
                info!(database = request.database, change = ?change, "Catalog updated");
                PhaseOutcome::Success
            }
            Err(e) => {
                let e = match e {
                    e @ IngestError::CatalogUpdate { .. } => e,
                    other => IngestError::CatalogUpdate {
                        table: request.table.to_string(),
                        reason: other.to_string(),
                    },
                };
                PhaseOutcome::Failure(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::JsonFileCatalog;
    use crate::storage::{LocalParquetSink, WriteSummary};
    use crate::types::ColumnData;
    use arrow::datatypes::DataType;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::File;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn rows() -> RowSet {
        RowSet::from_columns(vec![
            (
                "participant_full_id",
                ColumnData::Utf8(vec![Some("1-2-3-P001".to_string()); 2]),
            ),
            ("hr", ColumnData::Float64(vec![Some(60.0), Some(61.0)])),
        ])
        .unwrap()
    }

    fn partition_cols() -> Vec<String> {
        vec![PARTICIPANT_FULL_ID_COLUMN.to_string()]
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Sink that fails `failures` times with `kind` before succeeding
    struct FlakySink {
        failures: u32,
        kind: io::ErrorKind,
        calls: AtomicU32,
    }

    impl FlakySink {
        fn new(failures: u32, kind: io::ErrorKind) -> Self {
            Self {
                failures,
                kind,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl DatasetSink for FlakySink {
        fn location(&self, table: &str) -> String {
            format!("memory://{}", table)
        }

        fn write_partitioned(
            &self,
            rows: &RowSet,
            table: &str,
            _partition_cols: &[String],
            _mode: PublishMode,
        ) -> Result<WriteSummary, IngestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(io::Error::new(self.kind, "simulated").into());
            }
            Ok(WriteSummary {
                location: self.location(table),
                partitions: 1,
                rows: rows.num_rows(),
                files: vec!["part-0.parquet".to_string()],
            })
        }
    }

    fn request<'a>(rows: &'a RowSet, cols: &'a [String]) -> PublishRequest<'a> {
        PublishRequest {
            rows,
            table: "raw_ibi",
            database: "study",
            partition_cols: cols,
            mode: PublishMode::Append,
        }
    }

    #[test]
    fn test_publish_to_local_sink() {
        let dir = tempdir().unwrap();
        let sink = LocalParquetSink::new(dir.path().join("data").to_str().unwrap()).unwrap();
        let catalog = Arc::new(JsonFileCatalog::new(dir.path().join("catalog")));
        let publisher = Publisher::new(Arc::new(sink.clone()), catalog.clone());

        let rows = rows();
        let cols = partition_cols();
        let report = publisher.publish(&request(&rows, &cols));

        assert_eq!(report.storage, PhaseOutcome::Success);
        assert_eq!(report.catalog, PhaseOutcome::Success);
        assert_eq!(report.rows, 2);
        assert_eq!(sink.dataset_files("raw_ibi").unwrap().len(), 1);
        assert!(catalog.table_exists("study", "raw_ibi").unwrap());
    }

    #[test]
    fn test_storage_failure_skips_catalog() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(JsonFileCatalog::new(dir.path()));
        let sink = Arc::new(FlakySink::new(u32::MAX, io::ErrorKind::PermissionDenied));
        let publisher = Publisher::new(sink.clone(), catalog.clone()).with_retry(fast_retry(3));

        let rows = rows();
        let cols = partition_cols();
        let report = publisher.publish(&request(&rows, &cols));

        assert!(report.storage.is_failure());
        assert!(!report.catalog.is_success());
        assert!(matches!(report.catalog, PhaseOutcome::Skipped(_)));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert!(!catalog.table_exists("study", "raw_ibi").unwrap());
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(JsonFileCatalog::new(dir.path()));
        let sink = Arc::new(FlakySink::new(2, io::ErrorKind::TimedOut));
        let publisher = Publisher::new(sink.clone(), catalog).with_retry(fast_retry(3));

        let rows = rows();
        let cols = partition_cols();
        let report = publisher.publish(&request(&rows, &cols));

        assert_eq!(report.storage, PhaseOutcome::Success);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), IngestError> = fast_retry(2).run("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Interrupted, "again").into())
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_table_skips_both_phases() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(FlakySink::new(0, io::ErrorKind::Other));
        let publisher = Publisher::new(sink.clone(), Arc::new(JsonFileCatalog::new(dir.path())));

        let empty = RowSet::new();
        let cols = partition_cols();
        let report = publisher.publish(&request(&empty, &cols));

        assert!(matches!(report.storage, PhaseOutcome::Skipped(_)));
        assert!(matches!(report.catalog, PhaseOutcome::Skipped(_)));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_partition_cols_must_start_with_participant() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(FlakySink::new(0, io::ErrorKind::Other));
        let publisher = Publisher::new(sink, Arc::new(JsonFileCatalog::new(dir.path())));

        let rows = rows();
        let cols = vec!["device_id".to_string()];
        let report = publisher.publish(&request(&rows, &cols));
        assert!(report.storage.is_failure());
    }

    fn column_types_on_disk(sink: &LocalParquetSink, column: &str) -> Vec<DataType> {
        sink.dataset_files("raw_ibi")
            .unwrap()
            .iter()
            .map(|path| {
                let builder =
                    ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap()).unwrap();
                builder
                    .schema()
                    .field_with_name(column)
                    .unwrap()
                    .data_type()
                    .clone()
            })
            .collect()
    }

    fn local_publisher(dir: &Path) -> (Publisher, LocalParquetSink, Arc<JsonFileCatalog>) {
        let sink = LocalParquetSink::new(dir.join("data").to_str().unwrap()).unwrap();
        let catalog = Arc::new(JsonFileCatalog::new(dir.join("catalog")));
        let publisher = Publisher::new(Arc::new(sink.clone()), catalog.clone());
        (publisher, sink, catalog)
    }

    fn with_hr(hr: ColumnData) -> RowSet {
        let mut rows = rows();
        rows.remove_column("hr");
        rows.push_column("hr", hr).unwrap();
        rows
    }

    #[test]
    fn test_append_after_all_null_day_keeps_registered_type() {
        let dir = tempdir().unwrap();
        let (publisher, sink, catalog) = local_publisher(dir.path());
        let cols = partition_cols();

        let not_worn = with_hr(ColumnData::Utf8(vec![None, None]));
        let first = publisher.publish(&request(&not_worn, &cols));
        assert_eq!(first.catalog, PhaseOutcome::Success);

        let worn = with_hr(ColumnData::Float64(vec![Some(62.0), Some(64.5)]));
        let second = publisher.publish(&request(&worn, &cols));
        assert_eq!(second.storage, PhaseOutcome::Success);
        assert_eq!(second.catalog, PhaseOutcome::Success);

        let stored = catalog.get_table("study", "raw_ibi").unwrap().unwrap();
        assert_eq!(stored.column("hr").unwrap().column_type, "string");
        assert_eq!(
            column_types_on_disk(&sink, "hr"),
            vec![DataType::Utf8, DataType::Utf8]
        );
    }

    #[test]
    fn test_append_widens_to_registered_double() {
        let dir = tempdir().unwrap();
        let (publisher, sink, _catalog) = local_publisher(dir.path());
        let cols = partition_cols();

        publisher.publish(&request(&rows(), &cols));
        let integral = with_hr(ColumnData::Int64(vec![Some(70), Some(71)]));
        let report = publisher.publish(&request(&integral, &cols));

        assert_eq!(report.storage, PhaseOutcome::Success);
        assert_eq!(
            column_types_on_disk(&sink, "hr"),
            vec![DataType::Float64, DataType::Float64]
        );
    }

    #[test]
    fn test_append_with_conflicting_type_writes_nothing() {
        let dir = tempdir().unwrap();
        let (publisher, sink, catalog) = local_publisher(dir.path());
        let cols = partition_cols();

        let integral = with_hr(ColumnData::Int64(vec![Some(70), Some(71)]));
        publisher.publish(&request(&integral, &cols));

        let report = publisher.publish(&request(&rows(), &cols));
        assert!(report.storage.is_failure());
        assert!(matches!(report.catalog, PhaseOutcome::Skipped(_)));
        assert_eq!(sink.dataset_files("raw_ibi").unwrap().len(), 1);
        let stored = catalog.get_table("study", "raw_ibi").unwrap().unwrap();
        assert_eq!(stored.column("hr").unwrap().column_type, "bigint");
    }

    #[test]
    fn test_overwrite_ignores_registered_types() {
        let dir = tempdir().unwrap();
        let (publisher, sink, catalog) = local_publisher(dir.path());
        let cols = partition_cols();

        let integral = with_hr(ColumnData::Int64(vec![Some(70), Some(71)]));
        publisher.publish(&request(&integral, &cols));

        let rows = rows();
        let mut replace = request(&rows, &cols);
        replace.mode = PublishMode::Overwrite;
        let report = publisher.publish(&replace);

        assert_eq!(report.storage, PhaseOutcome::Success);
        assert_eq!(column_types_on_disk(&sink, "hr"), vec![DataType::Float64]);
        let stored = catalog.get_table("study", "raw_ibi").unwrap().unwrap();
        assert_eq!(stored.column("hr").unwrap().column_type, "double");
    }

    #[test]
    fn test_missing_partition_column_is_named() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(FlakySink::new(0, io::ErrorKind::Other));
        let publisher = Publisher::new(sink.clone(), Arc::new(JsonFileCatalog::new(dir.path())));

        let rows = rows();
        let cols = vec![PARTICIPANT_FULL_ID_COLUMN.to_string(), "timezone".to_string()];
        let report = publisher.publish(&request(&rows, &cols));

        match report.storage {
            PhaseOutcome::Failure(reason) => assert!(reason.contains("'timezone'")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }
}
