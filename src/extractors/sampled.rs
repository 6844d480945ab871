//! Uniformly sampled raw signal extractors
//!
//! Signals such as EDA, skin temperature and BVP are exported as a start
//! timestamp (microseconds), a sampling frequency and a flat array of values.

use super::{wall_clock_columns, SignalExtractor};
use crate::error::IngestError;
use crate::schema::DecodedRecord;
use crate::types::{ColumnData, RowSet};

/// Electrodermal activity (microsiemens)
pub const RAW_EDA: SampledSignalExtractor = SampledSignalExtractor {
    table: "raw_eda",
    payload: "rawData.eda",
    value_column: "eda",
};

/// Skin temperature (degrees Celsius)
pub const RAW_TEMPERATURE: SampledSignalExtractor = SampledSignalExtractor {
    table: "raw_temperature",
    payload: "rawData.temperature",
    value_column: "temperature",
};

/// Blood volume pulse
pub const RAW_BVP: SampledSignalExtractor = SampledSignalExtractor {
    table: "raw_bvp",
    payload: "rawData.bvp",
    value_column: "bvp",
};

/// Extractor for one uniformly sampled payload
#[derive(Debug, Clone, Copy)]
pub struct SampledSignalExtractor {
    pub table: &'static str,
    pub payload: &'static str,
    pub value_column: &'static str,
}

impl SignalExtractor for SampledSignalExtractor {
    fn table_name(&self) -> &'static str {
        self.table
    }

    fn extract(&self, record: &DecodedRecord) -> Result<RowSet, IngestError> {
        let values = match record.get_f64_array(&format!("{}.values", self.payload)) {
            Some(values) => values?,
            None => Vec::new(),
        };
        let timezone = record.timezone().unwrap_or(0);
        if values.is_empty() {
            return sampled_rows(self.value_column, 0, 1.0, &[], timezone);
        }

        let start_us = record
            .get_i64(&format!("{}.timestampStart", self.payload))
            .ok_or_else(|| {
                IngestError::InvalidRecord(format!("{} has no timestampStart", self.payload))
            })?;
        let frequency = record
            .get_f64(&format!("{}.samplingFrequency", self.payload))
            .ok_or_else(|| {
                IngestError::InvalidRecord(format!("{} has no samplingFrequency", self.payload))
            })?;

        sampled_rows(self.value_column, start_us, frequency, &values, timezone)
    }
}

/// Build rows for samples starting at `start_us` spaced `1 / frequency_hz` apart
pub fn sampled_rows(
    value_column: &str,
    start_us: i64,
    frequency_hz: f64,
    values: &[f64],
    timezone_offset_sec: i64,
) -> Result<RowSet, IngestError> {
    if !values.is_empty() && !(frequency_hz.is_finite() && frequency_hz > 0.0) {
        return Err(IngestError::InvalidRecord(format!(
            "sampling frequency must be positive, got {}",
            frequency_hz
        )));
    }

    let start_ns = start_us.checked_mul(1_000).ok_or_else(|| {
        IngestError::InvalidRecord(format!("start timestamp {}us is out of range", start_us))
    })?;
    let period_ns = 1e9 / frequency_hz;
    let timestamps: Vec<i64> = (0..values.len())
        .map(|i| start_ns.saturating_add((i as f64 * period_ns).round() as i64))
        .collect();

    let (datetime_utc, datetime) = wall_clock_columns(&timestamps, timezone_offset_sec)?;

    RowSet::from_columns(vec![
        ("timestamp_ns", ColumnData::Int64(timestamps.into_iter().map(Some).collect())),
        ("datetime_utc", ColumnData::Timestamp(datetime_utc)),
        ("datetime", ColumnData::Timestamp(datetime)),
        (value_column, ColumnData::Float64(values.iter().map(|v| Some(*v)).collect())),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_four_hz_spacing() {
        let rows = sampled_rows("eda", 1_000_000, 4.0, &[0.1, 0.2, 0.3], 0).unwrap();
        assert_eq!(
            rows.column("timestamp_ns").unwrap().data,
            ColumnData::Int64(vec![
                Some(1_000_000_000),
                Some(1_250_000_000),
                Some(1_500_000_000)
            ])
        );
    }

    #[test]
    fn test_extract_eda_payload() {
        let record = DecodedRecord::new(json!({
            "timezone": 0,
            "rawData": {
                "eda": { "timestampStart": 0, "samplingFrequency": 2.0, "values": [1.5, 2.5] }
            }
        }))
        .unwrap();

        let rows = RAW_EDA.extract(&record).unwrap();
        assert_eq!(rows.num_rows(), 2);
        assert_eq!(
            rows.column("eda").unwrap().data,
            ColumnData::Float64(vec![Some(1.5), Some(2.5)])
        );
    }

    #[test]
    fn test_missing_payload_is_empty() {
        let record = DecodedRecord::new(json!({ "rawData": {} })).unwrap();
        let rows = RAW_TEMPERATURE.extract(&record).unwrap();
        assert!(rows.is_empty());
        assert_eq!(
            rows.column_names(),
            vec!["timestamp_ns", "datetime_utc", "datetime", "temperature"]
        );
    }

    #[test]
    fn test_zero_frequency_rejected() {
        let result = sampled_rows("bvp", 0, 0.0, &[1.0], 0);
        assert!(matches!(result, Err(IngestError::InvalidRecord(_))));
    }
}
