//! Inter-beat interval extractor
//!
//! Converts absolute systolic peak timestamps into inter-beat intervals and
//! instantaneous heart rate.

use super::{wall_clock_columns, SignalExtractor};
use crate::error::IngestError;
use crate::schema::DecodedRecord;
use crate::types::{ColumnData, RowSet};

/// Path of the peak timestamp array (nanoseconds since epoch)
pub const PEAKS_PATH: &str = "rawData.systolicPeaks.peaksTimeNanos";

const NANOS_PER_MILLI: f64 = 1_000_000.0;
const MILLIS_PER_MINUTE: f64 = 60_000.0;

/// Extractor for the `raw_ibi` table
pub struct RawIbiExtractor;

impl SignalExtractor for RawIbiExtractor {
    fn table_name(&self) -> &'static str {
        "raw_ibi"
    }

    fn extract(&self, record: &DecodedRecord) -> Result<RowSet, IngestError> {
        let peaks = match record.get_i64_array(PEAKS_PATH) {
            Some(peaks) => peaks?,
            None => Vec::new(),
        };
        ibi_rows(&peaks, record.timezone().unwrap_or(0))
    }
}

/// Build IBI rows from strictly increasing peak timestamps
///
/// Each row describes the interval ending at a peak, so `n` peaks give
/// `n - 1` rows; fewer than two peaks give an empty row-set.
pub fn ibi_rows(peaks_ns: &[i64], timezone_offset_sec: i64) -> Result<RowSet, IngestError> {
    let ends: &[i64] = peaks_ns.get(1..).unwrap_or(&[]);

    let mut ibi_ms = Vec::with_capacity(ends.len());
    let mut hr = Vec::with_capacity(ends.len());
    for pair in peaks_ns.windows(2) {
        let delta = pair[1].checked_sub(pair[0]).filter(|d| *d > 0).ok_or_else(|| {
            IngestError::InvalidRecord(format!(
                "systolic peaks are not strictly increasing ({} then {})",
                pair[0], pair[1]
            ))
        })?;
        let ms = delta as f64 / NANOS_PER_MILLI;
        ibi_ms.push(Some(ms));
        hr.push(Some(MILLIS_PER_MINUTE / ms));
    }

    let (datetime_utc, datetime) = wall_clock_columns(ends, timezone_offset_sec)?;

    RowSet::from_columns(vec![
        ("timestamp_ns", ColumnData::Int64(ends.iter().map(|t| Some(*t)).collect())),
        ("datetime_utc", ColumnData::Timestamp(datetime_utc)),
        ("datetime", ColumnData::Timestamp(datetime)),
        ("ibi_ms", ColumnData::Float64(ibi_ms)),
        ("hr", ColumnData::Float64(hr)),
    ])
}
