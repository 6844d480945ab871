//! Partitioned columnar storage
//!
//! A [`DatasetSink`] persists one canonical table as a Hive-style partitioned
//! dataset under `<root>/<table>/<col>=<value>/...`. [`LocalParquetSink`] is the
//! filesystem implementation: one Snappy-compressed Parquet file per partition,
//! named after the SHA-256 of its content so that re-publishing the same rows
//! rewrites the same file instead of adding a duplicate.

use arrow::array::{
    ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::IngestError;
use crate::types::{ColumnData, PublishMode, RowSet};

const FILE_SCHEME: &str = "file://";

/// What a sink wrote for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    /// Dataset location of the table
    pub location: String,
    pub partitions: usize,
    pub rows: usize,
    /// Files written, relative to `location`
    pub files: Vec<String>,
}

/// Destination for partitioned table data
pub trait DatasetSink: Send + Sync {
    /// Location of the dataset for `table`
    fn location(&self, table: &str) -> String;

    /// Write `rows` as the dataset `table`, partitioned by `partition_cols`
    fn write_partitioned(
        &self,
        rows: &RowSet,
        table: &str,
        partition_cols: &[String],
        mode: PublishMode,
    ) -> Result<WriteSummary, IngestError>;
}

/// Resolve a storage root string to a local directory
///
/// Plain paths and `file://` URLs are accepted; any other scheme is a
/// configuration error.
pub fn local_root(root: &str) -> Result<PathBuf, IngestError> {
    if root.trim().is_empty() {
        return Err(IngestError::Configuration(
            "storage root must not be empty".to_string(),
        ));
    }
    if let Some(path) = root.strip_prefix(FILE_SCHEME) {
        return Ok(PathBuf::from(path));
    }
    if let Some((scheme, _)) = root.split_once("://") {
        return Err(IngestError::Configuration(format!(
            "storage scheme '{}://' is not supported by the local Parquet sink",
            scheme
        )));
    }
    Ok(PathBuf::from(root))
}

/// Parquet files on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalParquetSink {
    root: PathBuf,
}

impl LocalParquetSink {
    pub fn new(root: &str) -> Result<Self, IngestError> {
        Ok(Self {
            root: local_root(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    /// All Parquet files of `table`, sorted
    pub fn dataset_files(&self, table: &str) -> Result<Vec<PathBuf>, IngestError> {
        let mut files = Vec::new();
        let dir = self.dataset_dir(table);
        if dir.is_dir() {
            collect_parquet_files(&dir, &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    fn write_file(&self, dir: &Path, bytes: &[u8]) -> Result<PathBuf, IngestError> {
        fs::create_dir_all(dir)?;
        let name = format!("part-{}.parquet", hex_digest(bytes));
        let path = dir.join(&name);
        let temp_path = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));

        fs::write(&temp_path, bytes)?;
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(path)
    }
}

impl DatasetSink for LocalParquetSink {
    fn location(&self, table: &str) -> String {
        self.dataset_dir(table).display().to_string()
    }

    fn write_partitioned(
        &self,
        rows: &RowSet,
        table: &str,
        partition_cols: &[String],
        mode: PublishMode,
    ) -> Result<WriteSummary, IngestError> {
        let dataset = self.dataset_dir(table);
        let partitions = rows
            .partition_by(partition_cols)
            .map_err(|reason| IngestError::StorageWrite {
                table: table.to_string(),
                reason,
            })?;

        if mode == PublishMode::Overwrite && dataset.exists() {
            debug!(table, path = %dataset.display(), "Removing existing dataset");
            fs::remove_dir_all(&dataset)?;
        }

        let mut files = Vec::with_capacity(partitions.len());
        for (values, part) in &partitions {
            let relative: PathBuf = partition_cols
                .iter()
                .zip(values)
                .map(|(col, value)| format!("{}={}", col, escape_partition_value(value)))
                .collect();
            let bytes = encode_parquet(part)?;
            let path = self.write_file(&dataset.join(&relative), &bytes)?;
            debug!(table, path = %path.display(), rows = part.num_rows(), "Wrote partition file");

            let relative_file = path
                .strip_prefix(&dataset)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| path.display().to_string());
            files.push(relative_file);
        }

        Ok(WriteSummary {
            location: self.location(table),
            partitions: partitions.len(),
            rows: rows.num_rows(),
            files,
        })
    }
}

/// Convert a row-set into an Arrow record batch
///
/// Timestamps are stored as microseconds without a timezone.
pub fn to_record_batch(rows: &RowSet) -> Result<RecordBatch, IngestError> {
    let mut fields = Vec::with_capacity(rows.num_columns());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(rows.num_columns());

    for column in rows.columns() {
        let (data_type, array): (DataType, ArrayRef) = match &column.data {
            ColumnData::Int64(v) => (DataType::Int64, Arc::new(Int64Array::from(v.clone()))),
            ColumnData::Float64(v) => (DataType::Float64, Arc::new(Float64Array::from(v.clone()))),
            ColumnData::Utf8(v) => (DataType::Utf8, Arc::new(StringArray::from(v.clone()))),
            ColumnData::Timestamp(v) => (
                DataType::Timestamp(TimeUnit::Microsecond, None),
                Arc::new(TimestampMicrosecondArray::from(
                    v.iter()
                        .map(|t| t.map(|t| t.and_utc().timestamp_micros()))
                        .collect::<Vec<_>>(),
                )),
            ),
        };
        fields.push(Field::new(column.name.as_str(), data_type, true));
        arrays.push(array);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(rows.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        arrays,
        &options,
    )?)
}

/// Encode a row-set as a Snappy-compressed Parquet file in memory
pub fn encode_parquet(rows: &RowSet) -> Result<Vec<u8>, IngestError> {
    let batch = to_record_batch(rows)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))?;
    writer.write(&batch)?;
    Ok(writer.into_inner()?)
}

fn hex_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Percent-encode characters that would break a `key=value` directory name
fn escape_partition_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '/' | '\\' | '=' | '%' | ':' | '\n' | '\r' => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    escaped.push_str(&format!("%{:02X}", byte));
                }
            }
            _ => escaped.push(c),
        }
    }
    if escaped.is_empty() || escaped == "." || escaped == ".." {
        escaped = escaped.replace('.', "%2E");
        if escaped.is_empty() {
            escaped.push_str("__EMPTY__");
        }
    }
    escaped
}

fn collect_parquet_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), IngestError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_parquet_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "parquet") {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use tempfile::tempdir;

    fn rows() -> RowSet {
        let ts = |s: i64| DateTime::from_timestamp(s, 0).map(|d| d.naive_utc());
        RowSet::from_columns(vec![
            (
                "participant_full_id",
                ColumnData::Utf8(vec![
                    Some("1-2-3-P001".to_string()),
                    Some("1-2-3-P002".to_string()),
                    Some("1-2-3-P001".to_string()),
                ]),
            ),
            ("timestamp_ns", ColumnData::Int64(vec![Some(1), Some(2), Some(3)])),
            ("datetime_utc", ColumnData::Timestamp(vec![ts(1), ts(2), ts(3)])),
            ("hr", ColumnData::Float64(vec![Some(60.0), None, Some(61.0)])),
        ])
        .unwrap()
    }

    fn partition_cols() -> Vec<String> {
        vec!["participant_full_id".to_string()]
    }

    fn read_back(path: &Path) -> RecordBatch {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>().unwrap();
        arrow::compute::concat_batches(&batches[0].schema(), &batches).unwrap()
    }

    #[test]
    fn test_local_root_schemes() {
        assert_eq!(local_root("/data/out").unwrap(), PathBuf::from("/data/out"));
        assert_eq!(local_root("file:///data/out").unwrap(), PathBuf::from("/data/out"));
        assert!(matches!(
            local_root("s3://bucket/prefix"),
            Err(IngestError::Configuration(_))
        ));
        assert!(matches!(local_root(""), Err(IngestError::Configuration(_))));
    }

    #[test]
    fn test_writes_one_file_per_partition() {
        let dir = tempdir().unwrap();
        let sink = LocalParquetSink::new(dir.path().to_str().unwrap()).unwrap();

        let summary = sink
            .write_partitioned(&rows(), "raw_ibi", &partition_cols(), PublishMode::Append)
            .unwrap();
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.rows, 3);

        let files = sink.dataset_files("raw_ibi").unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0]
            .to_string_lossy()
            .contains("participant_full_id=1-2-3-P001"));

        let batch = read_back(&files[0]);
        assert_eq!(batch.num_rows(), 2);
        assert!(batch.schema().field_with_name("participant_full_id").is_err());
        assert_eq!(
            batch.schema().field_with_name("datetime_utc").unwrap().data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, None)
        );
    }

    #[test]
    fn test_republish_does_not_duplicate() {
        let dir = tempdir().unwrap();
        let sink = LocalParquetSink::new(dir.path().to_str().unwrap()).unwrap();

        let first = sink
            .write_partitioned(&rows(), "raw_ibi", &partition_cols(), PublishMode::Append)
            .unwrap();
        let second = sink
            .write_partitioned(&rows(), "raw_ibi", &partition_cols(), PublishMode::Append)
            .unwrap();

        assert_eq!(first.files, second.files);
        assert_eq!(sink.dataset_files("raw_ibi").unwrap().len(), 2);
    }

    #[test]
    fn test_overwrite_replaces_dataset() {
        let dir = tempdir().unwrap();
        let sink = LocalParquetSink::new(dir.path().to_str().unwrap()).unwrap();
        sink.write_partitioned(&rows(), "raw_ibi", &partition_cols(), PublishMode::Append)
            .unwrap();

        let only_first = rows().take(&[0]);
        sink.write_partitioned(&only_first, "raw_ibi", &partition_cols(), PublishMode::Overwrite)
            .unwrap();

        let files = sink.dataset_files("raw_ibi").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(read_back(&files[0]).num_rows(), 1);
    }

    #[test]
    fn test_null_partition_value_is_storage_error() {
        let dir = tempdir().unwrap();
        let sink = LocalParquetSink::new(dir.path().to_str().unwrap()).unwrap();
        let mut bad = rows();
        bad.set_constant(
            "participant_full_id",
            crate::types::ScalarValue::Utf8(None),
        );

        let err = sink
            .write_partitioned(&bad, "raw_ibi", &partition_cols(), PublishMode::Append)
            .unwrap_err();
        assert!(matches!(err, IngestError::StorageWrite { .. }));
        assert!(sink.dataset_files("raw_ibi").unwrap().is_empty());
    }

    #[test]
    fn test_file_names_are_content_digests() {
        // sha256("abc")
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let dir = tempdir().unwrap();
        let sink = LocalParquetSink::new(dir.path().to_str().unwrap()).unwrap();
        sink.write_partitioned(&rows(), "raw_ibi", &partition_cols(), PublishMode::Append)
            .unwrap();
        for file in sink.dataset_files("raw_ibi").unwrap() {
            let name = file.file_name().unwrap().to_str().unwrap().to_string();
            assert_eq!(name, format!("part-{}.parquet", hex_digest(&fs::read(&file).unwrap())));
        }
    }

    #[test]
    fn test_escape_partition_value() {
        assert_eq!(escape_partition_value("1-2-3-P001"), "1-2-3-P001");
        assert_eq!(escape_partition_value("a/b=c"), "a%2Fb%3Dc");
        assert_eq!(escape_partition_value(".."), "%2E%2E");
    }
}
