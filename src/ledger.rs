//! Ingestion ledger
//!
//! Records which date folders have already been published so a sync run can
//! skip them. The ledger is owned by the caller and passed to
//! [`crate::orchestrator::Orchestrator::sync_dates`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::IngestError;

/// Store of successfully ingested dates
pub trait IngestionLedger {
    fn contains(&self, date: NaiveDate) -> bool;

    /// Mark `date` as ingested; implementations persist immediately
    fn record(&mut self, date: NaiveDate) -> Result<(), IngestError>;

    /// Ingested dates, ascending
    fn ingested_dates(&self) -> Vec<NaiveDate>;

    /// Latest ingested date
    fn last_synced(&self) -> Option<NaiveDate> {
        self.ingested_dates().last().copied()
    }
}

/// Serialized ledger state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    /// Ingested date → time it was recorded
    pub dates: BTreeMap<NaiveDate, DateTime<Utc>>,
}

impl LedgerState {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// In-memory ledger, lost when dropped
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: LedgerState,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IngestionLedger for MemoryLedger {
    fn contains(&self, date: NaiveDate) -> bool {
        self.state.dates.contains_key(&date)
    }

    fn record(&mut self, date: NaiveDate) -> Result<(), IngestError> {
        self.state.dates.insert(date, Utc::now());
        Ok(())
    }

    fn ingested_dates(&self) -> Vec<NaiveDate> {
        self.state.dates.keys().copied().collect()
    }
}

/// Ledger persisted as a JSON file, rewritten atomically on every record
#[derive(Debug, Clone)]
pub struct JsonFileLedger {
    path: PathBuf,
    state: LedgerState,
}

impl JsonFileLedger {
    /// Open the ledger at `path`; a missing file starts an empty ledger
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let state = if path.is_file() {
            LedgerState::from_json(&fs::read_to_string(&path)?)?
        } else {
            LedgerState::default()
        };
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), IngestError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, self.state.to_json()?)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl IngestionLedger for JsonFileLedger {
    fn contains(&self, date: NaiveDate) -> bool {
        self.state.dates.contains_key(&date)
    }

    fn record(&mut self, date: NaiveDate) -> Result<(), IngestError> {
        self.state.dates.insert(date, Utc::now());
        self.persist()
    }

    fn ingested_dates(&self) -> Vec<NaiveDate> {
        self.state.dates.keys().copied().collect()
    }
}
