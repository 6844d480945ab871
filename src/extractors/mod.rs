//! Signal extractors
//!
//! Each extractor turns one decoded record into a normalized row-set for a
//! single canonical table. The registry is the only place that knows which
//! signals exist; adding a signal means adding one extractor and registering it.

mod ibi;
mod sampled;

pub use ibi::{ibi_rows, RawIbiExtractor, PEAKS_PATH};
pub use sampled::{sampled_rows, SampledSignalExtractor, RAW_BVP, RAW_EDA, RAW_TEMPERATURE};

use chrono::{DateTime, Duration, NaiveDateTime};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::IngestError;
use crate::schema::DecodedRecord;
use crate::types::RowSet;

/// Trait for per-signal record extractors
pub trait SignalExtractor: Send + Sync {
    /// Canonical table the extracted rows belong to
    fn table_name(&self) -> &'static str;

    /// Transform one decoded record into a row-set
    fn extract(&self, record: &DecodedRecord) -> Result<RowSet, IngestError>;
}

/// Mapping from canonical table name to its extractor
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: BTreeMap<&'static str, Arc<dyn SignalExtractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ExtractorRegistry {
    /// Registry with no extractors
    pub fn empty() -> Self {
        Self {
            extractors: BTreeMap::new(),
        }
    }

    /// Registry holding every extractor shipped with the crate
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let builtin: [Arc<dyn SignalExtractor>; 4] = [
            Arc::new(RawIbiExtractor),
            Arc::new(RAW_EDA),
            Arc::new(RAW_TEMPERATURE),
            Arc::new(RAW_BVP),
        ];
        for extractor in builtin {
            registry.extractors.insert(extractor.table_name(), extractor);
        }
        registry
    }

    /// Register an extractor; table names must be unique
    pub fn register(&mut self, extractor: Arc<dyn SignalExtractor>) -> Result<(), IngestError> {
        let name = extractor.table_name();
        if self.extractors.contains_key(name) {
            return Err(IngestError::Configuration(format!(
                "an extractor for table '{}' is already registered",
                name
            )));
        }
        self.extractors.insert(name, extractor);
        Ok(())
    }

    pub fn get(&self, table_name: &str) -> Option<&Arc<dyn SignalExtractor>> {
        self.extractors.get(table_name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.extractors.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SignalExtractor>> {
        self.extractors.values()
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

/// Wall-clock columns for nanosecond epoch timestamps
///
/// Returns `(datetime_utc, datetime)` where the local variant is shifted by
/// `timezone_offset_sec`.
pub(crate) fn wall_clock_columns(
    timestamps_ns: &[i64],
    timezone_offset_sec: i64,
) -> Result<(Vec<Option<NaiveDateTime>>, Vec<Option<NaiveDateTime>>), IngestError> {
    let offset = Duration::try_seconds(timezone_offset_sec).ok_or_else(|| {
        IngestError::InvalidRecord(format!(
            "timezone offset {}s is out of range",
            timezone_offset_sec
        ))
    })?;
    let mut utc = Vec::with_capacity(timestamps_ns.len());
    let mut local = Vec::with_capacity(timestamps_ns.len());
    for &ts in timestamps_ns {
        let dt = naive_from_nanos(ts).ok_or_else(|| {
            IngestError::InvalidRecord(format!("timestamp {}ns is out of range", ts))
        })?;
        let shifted = dt.checked_add_signed(offset).ok_or_else(|| {
            IngestError::InvalidRecord(format!(
                "timestamp {}ns shifted by {}s is out of range",
                ts, timezone_offset_sec
            ))
        })?;
        utc.push(Some(dt));
        local.push(Some(shifted));
    }
    Ok((utc, local))
}

pub(crate) fn naive_from_nanos(ns: i64) -> Option<NaiveDateTime> {
    let secs = ns.div_euclid(1_000_000_000);
    let nanos = ns.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}
