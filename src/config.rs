//! Run configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::accumulator::PARTICIPANT_FULL_ID_COLUMN;
use crate::error::IngestError;
use crate::publisher::RetryPolicy;
use crate::router::DEFAULT_WHITELIST_FILE;
use crate::storage::local_root;
use crate::types::PublishMode;

/// Catalog directory name under the storage root when none is configured
pub const DEFAULT_CATALOG_DIR: &str = "_catalog";

/// Kind of source data inside a participant folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// Raw Avro bundles under `raw_data/v6`
    RawAvro,
    /// Per-minute digital biomarker CSVs under `digital_biomarkers/aggregated_per_minute`
    AggregatedPerMinute,
}

impl DataCategory {
    pub fn all() -> Vec<DataCategory> {
        vec![DataCategory::RawAvro, DataCategory::AggregatedPerMinute]
    }

    /// Path of this category relative to a participant folder
    pub fn sub_path(&self) -> &'static Path {
        match self {
            DataCategory::RawAvro => Path::new("raw_data/v6"),
            DataCategory::AggregatedPerMinute => {
                Path::new("digital_biomarkers/aggregated_per_minute")
            }
        }
    }

    /// Extension of the source files, without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            DataCategory::RawAvro => "avro",
            DataCategory::AggregatedPerMinute => "csv",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::RawAvro => "avro",
            DataCategory::AggregatedPerMinute => "csv",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataCategory {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avro" | "raw_avro" => Ok(DataCategory::RawAvro),
            "csv" | "aggregated_per_minute" => Ok(DataCategory::AggregatedPerMinute),
            other => Err(IngestError::Configuration(format!(
                "unknown data category '{}', expected 'avro' or 'csv'",
                other
            ))),
        }
    }
}

/// Everything one ingestion run needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Dataset root: a local path or `file://` URL
    pub storage_root: String,
    /// Catalog directory; defaults to `<storage_root>/_catalog`
    pub catalog_root: Option<PathBuf>,
    pub database: String,
    pub partition_cols: Vec<String>,
    pub mode: PublishMode,
    pub categories: Vec<DataCategory>,
    pub max_workers: usize,
    pub retry: RetryPolicy,
    pub whitelist_path: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            storage_root: String::new(),
            catalog_root: None,
            database: String::new(),
            partition_cols: vec![PARTICIPANT_FULL_ID_COLUMN.to_string()],
            mode: PublishMode::Append,
            categories: DataCategory::all(),
            max_workers: 4,
            retry: RetryPolicy::default(),
            whitelist_path: PathBuf::from(DEFAULT_WHITELIST_FILE),
        }
    }
}

impl IngestConfig {
    pub fn new(storage_root: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            storage_root: storage_root.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// Resolved catalog directory
    pub fn catalog_dir(&self) -> Result<PathBuf, IngestError> {
        match &self.catalog_root {
            Some(root) => Ok(root.clone()),
            None => Ok(local_root(&self.storage_root)?.join(DEFAULT_CATALOG_DIR)),
        }
    }

    /// Check the configuration before any data is touched
    pub fn validate(&self) -> Result<(), IngestError> {
        local_root(&self.storage_root)?;

        if self.database.is_empty() {
            return Err(IngestError::Configuration(
                "database must not be empty".to_string(),
            ));
        }
        if !self
            .database
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(IngestError::Configuration(format!(
                "database '{}' may only contain letters, digits, '_' and '-'",
                self.database
            )));
        }

        if self.partition_cols.first().map(String::as_str) != Some(PARTICIPANT_FULL_ID_COLUMN) {
            return Err(IngestError::Configuration(format!(
                "partition columns must start with '{}'",
                PARTICIPANT_FULL_ID_COLUMN
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.partition_cols.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(IngestError::Configuration(format!(
                "partition column '{}' is listed twice",
                dup
            )));
        }

        if self.categories.is_empty() {
            return Err(IngestError::Configuration(
                "at least one data category must be enabled".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(IngestError::Configuration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(IngestError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> IngestConfig {
        IngestConfig::new("/tmp/out", "study_db")
    }

    #[test]
    fn test_defaults_validate() {
        let config = valid();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.categories, DataCategory::all());
        assert_eq!(config.catalog_dir().unwrap(), PathBuf::from("/tmp/out/_catalog"));
    }

    #[test]
    fn test_rejects_bad_settings() {
        let cases: Vec<Box<dyn Fn(&mut IngestConfig)>> = vec![
            Box::new(|c| c.database.clear()),
            Box::new(|c| c.database = "a/b".to_string()),
            Box::new(|c| c.partition_cols = vec!["device_id".to_string()]),
            Box::new(|c| {
                c.partition_cols = vec![
                    PARTICIPANT_FULL_ID_COLUMN.to_string(),
                    PARTICIPANT_FULL_ID_COLUMN.to_string(),
                ]
            }),
            Box::new(|c| c.max_workers = 0),
            Box::new(|c| c.categories.clear()),
            Box::new(|c| c.storage_root = "s3://bucket/prefix".to_string()),
        ];
        for mutate in cases {
            let mut config = valid();
            mutate(&mut config);
            assert!(matches!(
                config.validate(),
                Err(IngestError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_category_paths() {
        assert_eq!(DataCategory::RawAvro.sub_path(), Path::new("raw_data/v6"));
        assert_eq!(DataCategory::AggregatedPerMinute.extension(), "csv");
        assert_eq!("csv".parse::<DataCategory>().unwrap(), DataCategory::AggregatedPerMinute);
        assert!("parquet".parse::<DataCategory>().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = valid();
        config.mode = PublishMode::Overwrite;
        let json = serde_json::to_string(&config).unwrap();
        let parsed: IngestConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
