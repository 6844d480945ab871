//! Batch accumulator
//!
//! Folds the row-sets produced from many small source files into one table per
//! canonical name, stamping the columns that identify where each row came from.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::IngestError;
use crate::router::TableWhitelist;
use crate::schema::DecodedRecord;
use crate::types::{ColumnData, RowSet, ScalarValue};

pub const PARTICIPANT_FULL_ID_COLUMN: &str = "participant_full_id";
pub const DEVICE_ID_COLUMN: &str = "device_id";
pub const TIMEZONE_COLUMN: &str = "timezone";
pub const ALGOVERSION_COLUMN: &str = "algoversion";

/// Per-record metadata stamped on rows extracted from a decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub timezone: Option<i64>,
    pub algoversion: String,
}

/// Provenance of a row-set handed to [`BatchAccumulator::merge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTags {
    /// Stamped when present; tabular files usually carry their own column
    pub participant_full_id: Option<String>,
    pub device_id: String,
    /// Present for rows extracted from a decoded record
    pub record: Option<RecordMeta>,
}

impl SourceTags {
    /// Tags for rows extracted from one decoded record
    pub fn for_record(record: &DecodedRecord, device_id: &str) -> Result<Self, IngestError> {
        Ok(Self {
            participant_full_id: Some(record.participant_full_id()?),
            device_id: device_id.to_string(),
            record: Some(RecordMeta {
                timezone: record.timezone(),
                algoversion: record.algo_version(),
            }),
        })
    }

    /// Tags for rows read from a tabular file
    ///
    /// `participant_full_id` is only stamped when the file has no such column.
    pub fn for_table_file(device_id: &str, participant_full_id: Option<String>) -> Self {
        Self {
            participant_full_id,
            device_id: device_id.to_string(),
            record: None,
        }
    }

    fn stamp(&self, rows: &mut RowSet) {
        if let Some(meta) = &self.record {
            rows.set_constant(TIMEZONE_COLUMN, ScalarValue::Int64(meta.timezone));
            rows.set_constant(
                ALGOVERSION_COLUMN,
                ScalarValue::Utf8(Some(meta.algoversion.clone())),
            );
        }
        rows.set_constant(DEVICE_ID_COLUMN, ScalarValue::Utf8(Some(self.device_id.clone())));

        if let Some(id) = &self.participant_full_id {
            let carried = self.record.is_none() && rows.column(PARTICIPANT_FULL_ID_COLUMN).is_some();
            if !carried {
                rows.set_constant(PARTICIPANT_FULL_ID_COLUMN, ScalarValue::Utf8(Some(id.clone())));
            }
        }
    }
}

/// Result of one [`BatchAccumulator::merge`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Rows were appended to the table
    Appended(usize),
    /// The row-set had no rows; nothing changed
    Empty,
    /// The table is not enabled for this run
    NotWhitelisted,
}

/// In-memory tables for one date folder (or one source file)
#[derive(Debug, Clone)]
pub struct BatchAccumulator {
    whitelist: Arc<TableWhitelist>,
    tables: BTreeMap<String, RowSet>,
}

impl BatchAccumulator {
    pub fn new(whitelist: Arc<TableWhitelist>) -> Self {
        Self {
            whitelist,
            tables: BTreeMap::new(),
        }
    }

    /// Empty accumulator sharing this one's whitelist
    pub fn fork(&self) -> Self {
        Self::new(Arc::clone(&self.whitelist))
    }

    /// Whether rows for `table_name` would be kept
    pub fn accepts(&self, table_name: &str) -> bool {
        self.whitelist.route(table_name)
    }

    /// Stamp `rows` with `tags` and append them to `table_name`
    pub fn merge(
        &mut self,
        table_name: &str,
        mut rows: RowSet,
        tags: &SourceTags,
    ) -> Result<MergeOutcome, IngestError> {
        if !self.accepts(table_name) {
            return Ok(MergeOutcome::NotWhitelisted);
        }
        if rows.is_empty() {
            return Ok(MergeOutcome::Empty);
        }

        tags.stamp(&mut rows);
        check_participant_ids(table_name, &rows)?;

        let appended = rows.num_rows();
        self.append(table_name, rows)?;
        Ok(MergeOutcome::Appended(appended))
    }

    /// Fold every table of `other` into this accumulator
    ///
    /// All tables are checked before any is modified, so a mismatch leaves
    /// this accumulator untouched.
    pub fn absorb(&mut self, other: BatchAccumulator) -> Result<usize, IngestError> {
        for (name, rows) in &other.tables {
            if let Some(existing) = self.tables.get(name) {
                existing
                    .check_concat(rows)
                    .map_err(|reason| IngestError::SchemaMismatch {
                        table: name.clone(),
                        reason,
                    })?;
            }
        }

        let mut absorbed = 0;
        for (name, rows) in other.tables {
            absorbed += rows.num_rows();
            self.append(&name, rows)?;
        }
        Ok(absorbed)
    }

    fn append(&mut self, table_name: &str, rows: RowSet) -> Result<(), IngestError> {
        match self.tables.get_mut(table_name) {
            Some(existing) => existing
                .concat(rows)
                .map_err(|reason| IngestError::SchemaMismatch {
                    table: table_name.to_string(),
                    reason,
                }),
            None => {
                self.tables.insert(table_name.to_string(), rows);
                Ok(())
            }
        }
    }

    pub fn table(&self, table_name: &str) -> Option<&RowSet> {
        self.tables.get(table_name)
    }

    pub fn tables(&self) -> &BTreeMap<String, RowSet> {
        &self.tables
    }

    pub fn into_tables(self) -> BTreeMap<String, RowSet> {
        self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(RowSet::num_rows).sum()
    }
}

fn check_participant_ids(table_name: &str, rows: &RowSet) -> Result<(), IngestError> {
    let column = rows.column(PARTICIPANT_FULL_ID_COLUMN).ok_or_else(|| {
        IngestError::SchemaMismatch {
            table: table_name.to_string(),
            reason: format!("rows carry no '{}' column", PARTICIPANT_FULL_ID_COLUMN),
        }
    })?;
    match &column.data {
        ColumnData::Utf8(_) if column.data.null_count() == 0 => Ok(()),
        ColumnData::Utf8(_) => Err(IngestError::SchemaMismatch {
            table: table_name.to_string(),
            reason: format!("'{}' has null values", PARTICIPANT_FULL_ID_COLUMN),
        }),
        other => Err(IngestError::SchemaMismatch {
            table: table_name.to_string(),
            reason: format!(
                "'{}' must be a string column, found {}",
                PARTICIPANT_FULL_ID_COLUMN,
                other.column_type()
            ),
        }),
    }
}
