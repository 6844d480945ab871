//! Aggregated per-minute CSV reader
//!
//! Digital biomarker exports are already rectangular: one row per minute per
//! participant. Reading one amounts to parsing the file, inferring column types
//! and coercing the two declared timestamp columns.

use chrono::{DateTime, NaiveDateTime};
use std::path::Path;

use crate::error::IngestError;
use crate::router::table_name_from_csv_filename;
use crate::types::{ColumnData, ColumnType, RowSet};

/// Timestamp column holding ISO 8601 text
pub const TIMESTAMP_ISO_COLUMN: &str = "timestamp_iso";
/// Timestamp column holding integer epoch time
pub const TIMESTAMP_UNIX_COLUMN: &str = "timestamp_unix";

/// Rows read from one aggregated CSV file
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedTable {
    pub table_name: String,
    pub rows: RowSet,
}

/// Read one aggregated per-minute CSV file
pub fn read_aggregated_csv(path: impl AsRef<Path>) -> Result<AggregatedTable, IngestError> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| IngestError::decode(path, "file name is not valid UTF-8"))?;
    let table_name = table_name_from_csv_filename(file_name)
        .ok_or_else(|| IngestError::decode(path, "cannot derive a table name from the file name"))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| IngestError::decode(path, e))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| IngestError::decode(path, e))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record.map_err(|e| IngestError::decode(path, e))?;
        for (i, column) in cells.iter_mut().enumerate() {
            let value = record.get(i).filter(|v| !v.is_empty()).map(str::to_string);
            column.push(value);
        }
    }

    for required in [TIMESTAMP_ISO_COLUMN, TIMESTAMP_UNIX_COLUMN] {
        if !headers.iter().any(|h| h == required) {
            return Err(IngestError::decode(
                path,
                format!("missing required column '{}'", required),
            ));
        }
    }

    let mut rows = RowSet::new();
    for (name, values) in headers.into_iter().zip(cells) {
        let data = match name.as_str() {
            TIMESTAMP_ISO_COLUMN => coerce_timestamps(&values).map_err(|e| IngestError::decode(path, e))?,
            TIMESTAMP_UNIX_COLUMN => coerce_epoch(&values).map_err(|e| IngestError::decode(path, e))?,
            _ => infer_column(values),
        };
        rows.push_column(name, data)
            .map_err(|e| IngestError::decode(path, e))?;
    }

    Ok(AggregatedTable { table_name, rows })
}

/// Parse an ISO 8601 timestamp into naive UTC
///
/// Offsets are applied; text without an offset is taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"]
        .iter()
        .find_map(|fmt| {
            DateTime::parse_from_str(text, fmt)
                .map(|dt| dt.naive_utc())
                .or_else(|_| NaiveDateTime::parse_from_str(text, fmt))
                .ok()
        })
}

fn coerce_timestamps(values: &[Option<String>]) -> Result<ColumnData, String> {
    values
        .iter()
        .map(|v| match v {
            Some(text) => parse_timestamp(text)
                .map(Some)
                .ok_or_else(|| format!("'{}' is not a valid {}", text, TIMESTAMP_ISO_COLUMN)),
            None => Ok(None),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(ColumnData::Timestamp)
}

fn coerce_epoch(values: &[Option<String>]) -> Result<ColumnData, String> {
    values
        .iter()
        .map(|v| match v {
            Some(text) => parse_integral(text)
                .map(Some)
                .ok_or_else(|| format!("'{}' is not a valid {}", text, TIMESTAMP_UNIX_COLUMN)),
            None => Ok(None),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(ColumnData::Int64)
}

/// Integer text, or float text with no fractional part
fn parse_integral(text: &str) -> Option<i64> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(i);
    }
    let f = text.parse::<f64>().ok()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// Narrowest of Int64, Float64 and Utf8 that holds every non-null cell
fn infer_column(values: Vec<Option<String>>) -> ColumnData {
    let present: Vec<&String> = values.iter().flatten().collect();
    let inferred = if present.is_empty() {
        ColumnType::Utf8
    } else if present.iter().all(|v| v.parse::<i64>().is_ok()) {
        ColumnType::Int64
    } else if present.iter().all(|v| v.parse::<f64>().is_ok()) {
        ColumnType::Float64
    } else {
        ColumnType::Utf8
    };

    match inferred {
        ColumnType::Int64 => ColumnData::Int64(
            values
                .iter()
                .map(|v| v.as_ref().and_then(|s| s.parse().ok()))
                .collect(),
        ),
        ColumnType::Float64 => ColumnData::Float64(
            values
                .iter()
                .map(|v| v.as_ref().and_then(|s| s.parse().ok()))
                .collect(),
        ),
        _ => ColumnData::Utf8(values),
    }
}
