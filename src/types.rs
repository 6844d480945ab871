//! Core types for the ingestion pipeline
//!
//! This module defines the data structures that flow between pipeline stages:
//! column-typed row-sets produced by extractors, the write mode handed to the
//! publisher, and the per-table and per-run outcomes reported back to callers.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::error::IngestError;

/// Logical column type of a row-set column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int64,
    Float64,
    Utf8,
    Timestamp,
}

impl ColumnType {
    /// Type name used in catalog table definitions
    pub fn catalog_type(&self) -> &'static str {
        match self {
            ColumnType::Int64 => "bigint",
            ColumnType::Float64 => "double",
            ColumnType::Utf8 => "string",
            ColumnType::Timestamp => "timestamp",
        }
    }

    /// Inverse of [`ColumnType::catalog_type`]
    pub fn from_catalog_type(name: &str) -> Option<ColumnType> {
        match name {
            "bigint" => Some(ColumnType::Int64),
            "double" => Some(ColumnType::Float64),
            "string" => Some(ColumnType::Utf8),
            "timestamp" => Some(ColumnType::Timestamp),
            _ => None,
        }
    }

    /// Widest type that can hold values of both `self` and `other`, if any
    fn widen(self, other: ColumnType) -> Option<ColumnType> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (ColumnType::Int64, ColumnType::Float64) | (ColumnType::Float64, ColumnType::Int64) => {
                Some(ColumnType::Float64)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.catalog_type())
    }
}

/// A single (nullable) value, used to stamp constant columns
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Int64(Option<i64>),
    Float64(Option<f64>),
    Utf8(Option<String>),
    Timestamp(Option<NaiveDateTime>),
}

/// Column values, one variant per supported column type
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    Timestamp(Vec<Option<NaiveDateTime>>),
}

impl ColumnData {
    /// Empty column of the given type
    pub fn empty(column_type: ColumnType) -> Self {
        Self::nulls(column_type, 0)
    }

    /// Column of `len` nulls
    pub fn nulls(column_type: ColumnType, len: usize) -> Self {
        match column_type {
            ColumnType::Int64 => ColumnData::Int64(vec![None; len]),
            ColumnType::Float64 => ColumnData::Float64(vec![None; len]),
            ColumnType::Utf8 => ColumnData::Utf8(vec![None; len]),
            ColumnType::Timestamp => ColumnData::Timestamp(vec![None; len]),
        }
    }

    /// Column repeating `value` `len` times
    pub fn repeat(value: &ScalarValue, len: usize) -> Self {
        match value {
            ScalarValue::Int64(v) => ColumnData::Int64(vec![*v; len]),
            ScalarValue::Float64(v) => ColumnData::Float64(vec![*v; len]),
            ScalarValue::Utf8(v) => ColumnData::Utf8(vec![v.clone(); len]),
            ScalarValue::Timestamp(v) => ColumnData::Timestamp(vec![*v; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
            ColumnData::Timestamp(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Int64(_) => ColumnType::Int64,
            ColumnData::Float64(_) => ColumnType::Float64,
            ColumnData::Utf8(_) => ColumnType::Utf8,
            ColumnData::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    /// Number of null entries
    pub fn null_count(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.iter().filter(|x| x.is_none()).count(),
            ColumnData::Float64(v) => v.iter().filter(|x| x.is_none()).count(),
            ColumnData::Utf8(v) => v.iter().filter(|x| x.is_none()).count(),
            ColumnData::Timestamp(v) => v.iter().filter(|x| x.is_none()).count(),
        }
    }

    fn is_all_null(&self) -> bool {
        self.null_count() == self.len()
    }

    /// Render one cell as text; `None` for null cells
    pub fn render(&self, row: usize) -> Option<String> {
        match self {
            ColumnData::Int64(v) => v.get(row).copied().flatten().map(|x| x.to_string()),
            ColumnData::Float64(v) => v.get(row).copied().flatten().map(|x| x.to_string()),
            ColumnData::Utf8(v) => v.get(row).cloned().flatten(),
            ColumnData::Timestamp(v) => v
                .get(row)
                .copied()
                .flatten()
                .map(|x| x.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()),
        }
    }

    /// Convert to `target`, allowing Int64 → Float64 and any all-null column
    fn cast(self, target: ColumnType) -> Result<Self, String> {
        if self.column_type() == target {
            return Ok(self);
        }
        if self.is_all_null() {
            return Ok(Self::nulls(target, self.len()));
        }
        match (self, target) {
            (ColumnData::Int64(v), ColumnType::Float64) => Ok(ColumnData::Float64(
                v.into_iter().map(|x| x.map(|i| i as f64)).collect(),
            )),
            (other, target) => Err(format!(
                "cannot convert {} column to {}",
                other.column_type(),
                target
            )),
        }
    }

    /// Like `cast`, but any column may also be rendered as text
    fn conform(self, target: ColumnType) -> Result<Self, String> {
        if target == ColumnType::Utf8 && self.column_type() != ColumnType::Utf8 {
            return Ok(ColumnData::Utf8((0..self.len()).map(|row| self.render(row)).collect()));
        }
        self.cast(target)
    }

    fn extend(&mut self, other: ColumnData) -> Result<(), String> {
        match (self, other) {
            (ColumnData::Int64(a), ColumnData::Int64(b)) => a.extend(b),
            (ColumnData::Float64(a), ColumnData::Float64(b)) => a.extend(b),
            (ColumnData::Utf8(a), ColumnData::Utf8(b)) => a.extend(b),
            (ColumnData::Timestamp(a), ColumnData::Timestamp(b)) => a.extend(b),
            (a, b) => {
                return Err(format!(
                    "cannot append {} values to {} column",
                    b.column_type(),
                    a.column_type()
                ))
            }
        }
        Ok(())
    }

    fn take(&self, indices: &[usize]) -> Self {
        match self {
            ColumnData::Int64(v) => ColumnData::Int64(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Float64(v) => ColumnData::Float64(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Utf8(v) => {
                ColumnData::Utf8(indices.iter().map(|&i| v[i].clone()).collect())
            }
            ColumnData::Timestamp(v) => {
                ColumnData::Timestamp(indices.iter().map(|&i| v[i]).collect())
            }
        }
    }
}

/// Named column of a row-set
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// Rectangular, column-typed table
///
/// Produced by an extractor from one decoded record or one tabular source file,
/// and grown by the accumulator into one table per canonical name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    columns: Vec<Column>,
    num_rows: usize,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row-set from named columns of equal length
    pub fn from_columns<S: Into<String>>(
        columns: impl IntoIterator<Item = (S, ColumnData)>,
    ) -> Result<Self, IngestError> {
        let mut rows = RowSet::new();
        for (name, data) in columns {
            rows.push_column(name, data)?;
        }
        Ok(rows)
    }

    /// Append a column; its length must match the existing columns
    pub fn push_column(
        &mut self,
        name: impl Into<String>,
        data: ColumnData,
    ) -> Result<(), IngestError> {
        let name = name.into();
        if self.column(&name).is_some() {
            return Err(IngestError::InvalidRecord(format!(
                "duplicate column '{}'",
                name
            )));
        }
        if !self.columns.is_empty() && data.len() != self.num_rows {
            return Err(IngestError::InvalidRecord(format!(
                "column '{}' has {} rows, expected {}",
                name,
                data.len(),
                self.num_rows
            )));
        }
        self.num_rows = data.len();
        self.columns.push(Column { name, data });
        Ok(())
    }

    /// Set `name` to `value` on every row, replacing any existing column
    pub fn set_constant(&mut self, name: &str, value: ScalarValue) {
        let data = ColumnData::repeat(&value, self.num_rows);
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(column) => column.data = data,
            None => self.columns.push(Column {
                name: name.to_string(),
                data,
            }),
        }
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        Some(self.columns.remove(idx))
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub(crate) fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Column names and types in column order
    pub fn schema(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.data.column_type()))
            .collect()
    }

    /// Append the rows of `other` (row-wise concatenation)
    ///
    /// Both sides must carry the same column names; column order may differ.
    /// Int64 columns widen to Float64 and all-null columns adopt the other
    /// side's type. A zero-row `other` is a no-op. On error `self` is unchanged.
    pub fn concat(&mut self, other: RowSet) -> Result<(), String> {
        if other.num_rows == 0 {
            return Ok(());
        }
        if self.columns.is_empty() {
            *self = other;
            return Ok(());
        }

        let plan = self.concat_plan(&other)?;
        let mut incoming: HashMap<String, ColumnData> = other
            .columns
            .into_iter()
            .map(|c| (c.name, c.data))
            .collect();

        for (column, target) in self.columns.iter_mut().zip(plan) {
            let theirs = incoming
                .remove(&column.name)
                .ok_or_else(|| format!("column '{}' vanished", column.name))?;
            let current = std::mem::replace(&mut column.data, ColumnData::empty(target));
            column.data = current.cast(target)?;
            column.data.extend(theirs.cast(target)?)?;
        }
        self.num_rows += other.num_rows;
        Ok(())
    }

    /// Check that `other` could be appended without modifying anything
    pub fn check_concat(&self, other: &RowSet) -> Result<(), String> {
        if other.num_rows == 0 || self.columns.is_empty() {
            return Ok(());
        }
        self.concat_plan(other).map(|_| ())
    }

    /// Resulting type of every column of `self` after appending `other`
    fn concat_plan(&self, other: &RowSet) -> Result<Vec<ColumnType>, String> {
        let mut mine: Vec<&str> = self.column_names();
        let mut theirs: Vec<&str> = other.column_names();
        mine.sort_unstable();
        theirs.sort_unstable();
        if mine != theirs {
            let missing: Vec<&str> = mine.iter().filter(|n| !theirs.contains(n)).copied().collect();
            let extra: Vec<&str> = theirs.iter().filter(|n| !mine.contains(n)).copied().collect();
            return Err(format!(
                "column sets differ (missing: [{}], unexpected: [{}])",
                missing.join(", "),
                extra.join(", ")
            ));
        }

        let mut plan = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let theirs = other
                .column(&column.name)
                .map(|c| &c.data)
                .ok_or_else(|| format!("column '{}' is missing", column.name))?;
            let target = if column.data.is_all_null() {
                Some(theirs.column_type())
            } else if theirs.is_all_null() {
                Some(column.data.column_type())
            } else {
                column.data.column_type().widen(theirs.column_type())
            };
            match target {
                Some(target) => plan.push(target),
                None => {
                    return Err(format!(
                        "column '{}' is {} but incoming rows are {}",
                        column.name,
                        column.data.column_type(),
                        theirs.column_type()
                    ))
                }
            }
        }
        Ok(plan)
    }

    /// Convert columns to the types of an existing table
    ///
    /// Columns not listed in `types` keep their type. Besides the conversions
    /// [`RowSet::concat`] allows, any column converts to `Utf8`. On error `self`
    /// is unchanged.
    pub fn conform_to(&mut self, types: &[(String, ColumnType)]) -> Result<(), String> {
        let mut converted = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let data = match types.iter().find(|(name, _)| *name == column.name) {
                Some((_, target)) => column
                    .data
                    .clone()
                    .conform(*target)
                    .map_err(|e| format!("column '{}': {}", column.name, e))?,
                None => column.data.clone(),
            };
            converted.push(data);
        }
        for (column, data) in self.columns.iter_mut().zip(converted) {
            column.data = data;
        }
        Ok(())
    }

    /// Row-set holding the rows at `indices`, in that order
    pub fn take(&self, indices: &[usize]) -> RowSet {
        RowSet {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: c.data.take(indices),
                })
                .collect(),
            num_rows: indices.len(),
        }
    }

    /// Split rows by the values of `keys`
    ///
    /// Returns one row-set per distinct key tuple, with the key columns removed.
    /// Every key cell must be non-null.
    pub fn partition_by(&self, keys: &[String]) -> Result<BTreeMap<Vec<String>, RowSet>, String> {
        let mut key_columns = Vec::with_capacity(keys.len());
        for key in keys {
            let column = self
                .column(key)
                .ok_or_else(|| format!("partition column '{}' is missing", key))?;
            key_columns.push(column);
        }

        let mut groups: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();
        for row in 0..self.num_rows {
            let mut values = Vec::with_capacity(key_columns.len());
            for column in &key_columns {
                let value = column
                    .data
                    .render(row)
                    .ok_or_else(|| format!("partition column '{}' is null at row {}", column.name, row))?;
                values.push(value);
            }
            groups.entry(values).or_default().push(row);
        }

        Ok(groups
            .into_iter()
            .map(|(values, indices)| {
                let mut part = self.take(&indices);
                for key in keys {
                    part.remove_column(key);
                }
                (values, part)
            })
            .collect())
    }

    /// Rows rendered as `name=value` strings, sorted
    ///
    /// Independent of row and column order, so two row-sets holding the same
    /// data compare equal.
    pub fn sorted_rows(&self) -> Vec<String> {
        let mut order: Vec<&Column> = self.columns.iter().collect();
        order.sort_by(|a, b| a.name.cmp(&b.name));
        let mut rows: Vec<String> = (0..self.num_rows)
            .map(|row| {
                order
                    .iter()
                    .map(|c| {
                        format!(
                            "{}={}",
                            c.name,
                            c.data.render(row).unwrap_or_else(|| "NULL".to_string())
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("|")
            })
            .collect();
        rows.sort();
        rows
    }
}

/// How the publisher treats an existing dataset and catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Keep existing data and table definition, adding to them
    #[default]
    Append,
    /// Replace existing data and redefine the table
    Overwrite,
}

impl PublishMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishMode::Append => "append",
            PublishMode::Overwrite => "overwrite",
        }
    }
}

impl std::str::FromStr for PublishMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(PublishMode::Append),
            "overwrite" => Ok(PublishMode::Overwrite),
            other => Err(IngestError::Configuration(format!(
                "unknown publish mode '{}', expected 'append' or 'overwrite'",
                other
            ))),
        }
    }
}

/// Outcome of one publish phase for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Success,
    Failure(String),
    Skipped(String),
}

impl PhaseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PhaseOutcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PhaseOutcome::Failure(_))
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Success => f.write_str("success"),
            PhaseOutcome::Failure(reason) => write!(f, "failure ({})", reason),
            PhaseOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
        }
    }
}

/// Publish result for one canonical table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePublishReport {
    pub table: String,
    pub rows: usize,
    pub storage: PhaseOutcome,
    pub catalog: PhaseOutcome,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

/// Run-level status of one publish phase across all tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseStatus {
    /// At least one table succeeded and none failed
    Succeeded,
    /// One or more tables failed
    Failed { tables: Vec<String> },
    /// No table reached this phase
    NothingPublished,
}

impl PhaseStatus {
    fn aggregate<'a>(outcomes: impl Iterator<Item = (&'a str, &'a PhaseOutcome)>) -> Self {
        let mut failed = Vec::new();
        let mut succeeded = false;
        for (table, outcome) in outcomes {
            match outcome {
                PhaseOutcome::Success => succeeded = true,
                PhaseOutcome::Failure(_) => failed.push(table.to_string()),
                PhaseOutcome::Skipped(_) => {}
            }
        }
        if !failed.is_empty() {
            PhaseStatus::Failed { tables: failed }
        } else if succeeded {
            PhaseStatus::Succeeded
        } else {
            PhaseStatus::NothingPublished
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PhaseStatus::Failed { .. })
    }
}

/// Overall storage/catalog status pair for one date folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub storage: PhaseStatus,
    pub catalog: PhaseStatus,
}

impl RunStatus {
    /// Fold per-table outcomes into one status per phase
    pub fn aggregate(reports: &[TablePublishReport]) -> Self {
        RunStatus {
            storage: PhaseStatus::aggregate(reports.iter().map(|r| (r.table.as_str(), &r.storage))),
            catalog: PhaseStatus::aggregate(reports.iter().map(|r| (r.table.as_str(), &r.catalog))),
        }
    }

    /// Whether the date folder counts as ingested
    pub fn is_ingested(&self) -> bool {
        !self.storage.is_failed() && !self.catalog.is_failed()
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(ids: &[&str], values: &[i64]) -> RowSet {
        RowSet::from_columns(vec![
            (
                "participant_full_id",
                ColumnData::Utf8(ids.iter().map(|s| Some(s.to_string())).collect()),
            ),
            ("value", ColumnData::Int64(values.iter().map(|v| Some(*v)).collect())),
        ])
        .unwrap()
    }

    #[test]
    fn test_push_column_length_mismatch() {
        let mut rows = sample(&["a", "b"], &[1, 2]);
        let result = rows.push_column("extra", ColumnData::Float64(vec![Some(1.0)]));
        assert!(result.is_err());
        assert_eq!(rows.num_columns(), 2);
    }

    #[test]
    fn test_concat_reorders_and_widens() {
        let mut left = sample(&["a"], &[1]);
        let right = RowSet::from_columns(vec![
            ("value", ColumnData::Float64(vec![Some(2.5)])),
            ("participant_full_id", ColumnData::Utf8(vec![Some("b".to_string())])),
        ])
        .unwrap();

        left.concat(right).unwrap();

        assert_eq!(left.num_rows(), 2);
        assert_eq!(
            left.column("value").unwrap().data,
            ColumnData::Float64(vec![Some(1.0), Some(2.5)])
        );
    }

    #[test]
    fn test_concat_all_null_column_adopts_type() {
        let mut left = RowSet::from_columns(vec![("reason", ColumnData::Utf8(vec![None, None]))]).unwrap();
        let right = RowSet::from_columns(vec![("reason", ColumnData::Int64(vec![Some(3)]))]).unwrap();

        left.concat(right).unwrap();
        assert_eq!(
            left.column("reason").unwrap().data,
            ColumnData::Int64(vec![None, None, Some(3)])
        );
    }

    #[test]
    fn test_concat_rejects_different_columns() {
        let mut left = sample(&["a"], &[1]);
        let right = RowSet::from_columns(vec![("other", ColumnData::Int64(vec![Some(1)]))]).unwrap();

        let err = left.concat(right).unwrap_err();
        assert!(err.contains("column sets differ"));
        assert_eq!(left.num_rows(), 1);
    }

    #[test]
    fn test_concat_rejects_incompatible_types_without_mutation() {
        let mut left = sample(&["a"], &[1]);
        let right = RowSet::from_columns(vec![
            ("participant_full_id", ColumnData::Utf8(vec![Some("b".to_string())])),
            ("value", ColumnData::Utf8(vec![Some("x".to_string())])),
        ])
        .unwrap();

        assert!(left.concat(right).is_err());
        assert_eq!(left, sample(&["a"], &[1]));
    }

    #[test]
    fn test_concat_empty_is_noop() {
        let mut left = sample(&["a", "b"], &[1, 2]);
        let empty = RowSet::from_columns(vec![
            ("participant_full_id", ColumnData::empty(ColumnType::Utf8)),
            ("value", ColumnData::empty(ColumnType::Int64)),
        ])
        .unwrap();

        left.concat(empty).unwrap();
        assert_eq!(left, sample(&["a", "b"], &[1, 2]));
    }

    #[test]
    fn test_set_constant_replaces_existing() {
        let mut rows = sample(&["a", "b"], &[1, 2]);
        rows.set_constant("participant_full_id", ScalarValue::Utf8(Some("z".to_string())));
        rows.set_constant("device_id", ScalarValue::Utf8(Some("d".to_string())));

        assert_eq!(rows.num_columns(), 3);
        assert_eq!(
            rows.column("participant_full_id").unwrap().data,
            ColumnData::Utf8(vec![Some("z".to_string()), Some("z".to_string())])
        );
    }

    #[test]
    fn test_partition_by_groups_and_drops_key() {
        let rows = sample(&["b", "a", "b"], &[1, 2, 3]);
        let parts = rows.partition_by(&["participant_full_id".to_string()]).unwrap();

        assert_eq!(parts.len(), 2);
        let b = &parts[&vec!["b".to_string()]];
        assert_eq!(b.num_rows(), 2);
        assert!(b.column("participant_full_id").is_none());
        assert_eq!(b.column("value").unwrap().data, ColumnData::Int64(vec![Some(1), Some(3)]));
    }

    #[test]
    fn test_partition_by_rejects_null_key() {
        let rows = RowSet::from_columns(vec![("participant_full_id", ColumnData::Utf8(vec![None]))]).unwrap();
        assert!(rows.partition_by(&["participant_full_id".to_string()]).is_err());
    }

    #[test]
    fn test_sorted_rows_ignores_order() {
        let a = sample(&["a", "b"], &[1, 2]);
        let b = RowSet::from_columns(vec![
            ("value", ColumnData::Int64(vec![Some(2), Some(1)])),
            (
                "participant_full_id",
                ColumnData::Utf8(vec![Some("b".to_string()), Some("a".to_string())]),
            ),
        ])
        .unwrap();
        assert_eq!(a.sorted_rows(), b.sorted_rows());
    }

    #[test]
    fn test_conform_to_existing_types() {
        let mut rows = RowSet::from_columns(vec![
            ("steps", ColumnData::Int64(vec![Some(10), None])),
            ("pulse_rate_bpm", ColumnData::Float64(vec![Some(62.5), None])),
            ("note", ColumnData::Utf8(vec![None, None])),
            ("extra", ColumnData::Int64(vec![Some(1), Some(2)])),
        ])
        .unwrap();
        let types = vec![
            ("steps".to_string(), ColumnType::Float64),
            ("pulse_rate_bpm".to_string(), ColumnType::Utf8),
            ("note".to_string(), ColumnType::Timestamp),
        ];

        rows.conform_to(&types).unwrap();
        assert_eq!(
            rows.column("steps").unwrap().data,
            ColumnData::Float64(vec![Some(10.0), None])
        );
        assert_eq!(
            rows.column("pulse_rate_bpm").unwrap().data,
            ColumnData::Utf8(vec![Some("62.5".to_string()), None])
        );
        assert_eq!(rows.column("note").unwrap().data.column_type(), ColumnType::Timestamp);
        assert_eq!(rows.column("extra").unwrap().data.column_type(), ColumnType::Int64);
    }

    #[test]
    fn test_conform_to_rejects_narrowing() {
        let mut rows =
            RowSet::from_columns(vec![("hr", ColumnData::Float64(vec![Some(60.5)]))]).unwrap();
        let before = rows.clone();

        let err = rows
            .conform_to(&[("hr".to_string(), ColumnType::Int64)])
            .unwrap_err();
        assert!(err.contains("'hr'"));
        assert_eq!(rows, before);
    }

    #[test]
    fn test_run_status_aggregation() {
        let report = |table: &str, storage: PhaseOutcome, catalog: PhaseOutcome| TablePublishReport {
            table: table.to_string(),
            rows: 1,
            storage,
            catalog,
            elapsed: Duration::from_millis(5),
        };

        let ok = RunStatus::aggregate(&[report("raw_ibi", PhaseOutcome::Success, PhaseOutcome::Success)]);
        assert_eq!(ok.storage, PhaseStatus::Succeeded);
        assert!(ok.is_ingested());

        let failed = RunStatus::aggregate(&[
            report("raw_ibi", PhaseOutcome::Success, PhaseOutcome::Success),
            report(
                "raw_eda",
                PhaseOutcome::Failure("disk full".to_string()),
                PhaseOutcome::Skipped("write failed".to_string()),
            ),
        ]);
        assert_eq!(
            failed.storage,
            PhaseStatus::Failed {
                tables: vec!["raw_eda".to_string()]
            }
        );
        assert_eq!(failed.catalog, PhaseStatus::Succeeded);
        assert!(!failed.is_ingested());

        assert_eq!(RunStatus::aggregate(&[]).storage, PhaseStatus::NothingPublished);
    }
}
