//! Table routing and whitelist filtering
//!
//! Maps source files and signals to canonical table names and decides whether
//! a table is enabled for the current run.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::error::IngestError;
use crate::extractors::{ExtractorRegistry, SignalExtractor};

/// Default whitelist location, relative to the working directory
pub const DEFAULT_WHITELIST_FILE: &str = "whitelist.txt";

/// Set of canonical table names eligible for publication
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableWhitelist {
    tables: HashSet<String>,
}

impl TableWhitelist {
    pub fn new<S: Into<String>>(tables: impl IntoIterator<Item = S>) -> Self {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// Load a whitelist file: one table per line, blank and `#` lines ignored
    ///
    /// A missing file is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(IngestError::Configuration(format!(
                "table whitelist {} not found",
                path.display()
            )));
        }
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// Parse whitelist text
    pub fn parse(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    /// Whether `table_name` is enabled (exact, case-sensitive match)
    pub fn route(&self, table_name: &str) -> bool {
        self.tables.contains(table_name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Table names, sorted
    pub fn tables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.iter().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Registered extractors whose tables are enabled by `whitelist`
pub fn route_avro_signals(
    registry: &ExtractorRegistry,
    whitelist: &TableWhitelist,
) -> Vec<Arc<dyn SignalExtractor>> {
    registry
        .iter()
        .filter(|e| whitelist.route(e.table_name()))
        .cloned()
        .collect()
}

/// Canonical table name for an aggregated per-minute CSV file
///
/// Takes the last underscore-delimited token of the file stem and replaces
/// dashes with underscores: `1-1-P001_2024-01-15_pulse-rate.csv` → `pulse_rate`.
pub fn table_name_from_csv_filename(file_name: &str) -> Option<String> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    let token = stem.rsplit('_').next()?;
    if token.is_empty() {
        return None;
    }
    Some(token.replace('-', "_"))
}

/// Participant full ID prefixed to an aggregated CSV file name
///
/// `1-1-1-P001_2024-01-15_pulse-rate.csv` → `1-1-1-P001`. Requires the
/// four-part `{org}-{site}-{study}-{participant}` shape.
pub fn participant_from_csv_filename(file_name: &str) -> Option<String> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    let (prefix, _) = stem.split_once('_')?;
    let parts: Vec<&str> = prefix.split('-').collect();
    (parts.len() == 4 && parts.iter().all(|p| !p.is_empty())).then(|| prefix.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_route_exact_match() {
        let whitelist = TableWhitelist::new(["raw_ibi"]);
        assert!(whitelist.route("raw_ibi"));
        assert!(!whitelist.route("raw_eda"));
        assert!(!whitelist.route("RAW_IBI"));
        assert!(!whitelist.route("raw_ibi "));
    }

    #[test]
    fn test_parse_skips_blank_and_comment_lines() {
        let whitelist = TableWhitelist::parse("raw_ibi\n\n  pulse_rate  \n# raw_eda\n");
        assert_eq!(whitelist.tables(), vec!["pulse_rate", "raw_ibi"]);
    }

    #[test]
    fn test_missing_whitelist_is_configuration_error() {
        let dir = tempdir().unwrap();
        let err = TableWhitelist::load(dir.path().join("whitelist.txt")).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("whitelist.txt");
        fs::write(&path, "raw_ibi\nraw_eda\n").unwrap();
        let whitelist = TableWhitelist::load(&path).unwrap();
        assert_eq!(whitelist.len(), 2);
    }

    #[test]
    fn test_route_avro_signals() {
        let registry = ExtractorRegistry::builtin();
        let whitelist = TableWhitelist::new(["raw_ibi", "pulse_rate"]);
        let enabled: Vec<&str> = route_avro_signals(&registry, &whitelist)
            .iter()
            .map(|e| e.table_name())
            .collect();
        assert_eq!(enabled, vec!["raw_ibi"]);
    }

    #[test]
    fn test_table_name_from_csv_filename() {
        assert_eq!(
            table_name_from_csv_filename("1-1-P001_2024-01-15_pulse-rate-variability.csv"),
            Some("pulse_rate_variability".to_string())
        );
        assert_eq!(
            table_name_from_csv_filename("1-1-P001_2024-01-15_eda.csv"),
            Some("eda".to_string())
        );
        assert_eq!(table_name_from_csv_filename("steps.csv"), Some("steps".to_string()));
        assert_eq!(table_name_from_csv_filename("trailing_.csv"), None);
    }

    #[test]
    fn test_participant_from_csv_filename() {
        assert_eq!(
            participant_from_csv_filename("1-1-1-P001_2024-01-15_pulse-rate.csv"),
            Some("1-1-1-P001".to_string())
        );
        assert_eq!(participant_from_csv_filename("1-1-P001_2024-01-15_eda.csv"), None);
        assert_eq!(participant_from_csv_filename("eda.csv"), None);
    }
}
