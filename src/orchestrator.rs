//! Ingestion orchestrator
//!
//! Walks a date folder of participant bundles, drives every source file
//! through decode, extract, route and accumulate, then publishes each
//! accumulated table once. Per-folder and per-file problems are logged and
//! recorded in the [`DateIngestReport`]; they never abort the run.
//!
//! ```text
//! <date>/
//!   <participant_id>-<device_id>/
//!     raw_data/v6/*.avro
//!     digital_biomarkers/aggregated_per_minute/*_<table>.csv
//! ```

use chrono::NaiveDate;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Span};
use uuid::Uuid;

use crate::accumulator::{BatchAccumulator, SourceTags, PARTICIPANT_FULL_ID_COLUMN};
use crate::aggregated::read_aggregated_csv;
use crate::catalog::JsonFileCatalog;
use crate::config::{DataCategory, IngestConfig};
use crate::decoder::AvroRecordReader;
use crate::error::IngestError;
use crate::extractors::{ExtractorRegistry, SignalExtractor};
use crate::ledger::IngestionLedger;
use crate::logging::{date_span, folder_span};
use crate::publisher::{PublishRequest, Publisher};
use crate::router::{
    participant_from_csv_filename, route_avro_signals, table_name_from_csv_filename,
    TableWhitelist,
};
use crate::storage::LocalParquetSink;
use crate::types::{duration_millis, RunStatus, TablePublishReport};

/// Date folder naming scheme
pub const DATE_FOLDER_FORMAT: &str = "%Y-%m-%d";

/// Identity parsed from a participant folder name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantFolder {
    pub participant_id: String,
    pub device_id: String,
}

impl ParticipantFolder {
    /// Parse `{participant_id}-{device_id}`, splitting at the first hyphen
    pub fn parse(name: &str) -> Result<Self, IngestError> {
        match name.split_once('-') {
            Some((participant, device)) if !participant.is_empty() && !device.is_empty() => {
                Ok(Self {
                    participant_id: participant.to_string(),
                    device_id: device.to_string(),
                })
            }
            _ => Err(IngestError::MalformedFolderName(name.to_string())),
        }
    }
}

/// A participant folder that was not ingested (or one of its categories)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderSkip {
    pub folder: String,
    pub reason: String,
}

/// A source file whose rows were discarded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of ingesting one date folder
#[derive(Debug, Clone, Serialize)]
pub struct DateIngestReport {
    pub run_id: Uuid,
    pub date: String,
    pub folders_scanned: usize,
    pub files_ingested: usize,
    /// Records (or single signals of a record) that were rejected
    pub records_skipped: usize,
    pub folder_skips: Vec<FolderSkip>,
    pub file_failures: Vec<FileFailure>,
    pub tables: Vec<TablePublishReport>,
    pub status: RunStatus,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl DateIngestReport {
    /// True unless the storage or catalog phase failed for some table
    pub fn is_ingested(&self) -> bool {
        self.status.is_ingested()
    }
}

/// Outcome of a sync over many date folders
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub ingested: Vec<NaiveDate>,
    pub failed: Vec<NaiveDate>,
    /// Dates already present in the ledger
    pub already_ingested: Vec<NaiveDate>,
    /// Dates at or before the cutoff
    pub before_cutoff: Vec<NaiveDate>,
    /// Entries that are not date folders
    pub ignored: Vec<String>,
    pub reports: Vec<DateIngestReport>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-file decode counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub records: usize,
    pub records_skipped: usize,
    pub rows: usize,
}

/// One source file queued for decoding
#[derive(Debug, Clone)]
struct FileJob {
    path: PathBuf,
    category: DataCategory,
    device_id: String,
}

/// Decode one source file into `acc`
///
/// Avro records without an enrollment, and signals an extractor rejects, are
/// skipped and counted; any other error aborts the file.
pub fn decode_file(
    path: &Path,
    category: DataCategory,
    device_id: &str,
    extractors: &[Arc<dyn SignalExtractor>],
    acc: &mut BatchAccumulator,
) -> Result<FileStats, IngestError> {
    let mut stats = FileStats::default();
    match category {
        DataCategory::RawAvro => {
            if extractors.is_empty() {
                return Ok(stats);
            }
            for record in AvroRecordReader::open(path)? {
                let record = record?;
                stats.records += 1;

                let tags = match SourceTags::for_record(&record, device_id) {
                    Ok(tags) => tags,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping record");
                        stats.records_skipped += 1;
                        continue;
                    }
                };
                for extractor in extractors {
                    let table = extractor.table_name();
                    match extractor.extract(&record) {
                        Ok(rows) => {
                            stats.rows += rows.num_rows();
                            acc.merge(table, rows, &tags)?;
                        }
                        Err(e @ IngestError::InvalidRecord(_)) => {
                            warn!(path = %path.display(), table, error = %e, "Skipping signal");
                            stats.records_skipped += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        DataCategory::AggregatedPerMinute => {
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let table = table_name_from_csv_filename(file_name).ok_or_else(|| {
                IngestError::decode(path, "cannot derive a table name from the file name")
            })?;
            if !acc.accepts(&table) {
                debug!(path = %path.display(), table = %table, "Table not whitelisted");
                return Ok(stats);
            }
            let tags =
                SourceTags::for_table_file(device_id, participant_from_csv_filename(file_name));

            let parsed = read_aggregated_csv(path)?;
            stats.records = parsed.rows.num_rows();
            stats.rows = parsed.rows.num_rows();
            let has_participant = parsed.rows.column(PARTICIPANT_FULL_ID_COLUMN).is_some();
            if !has_participant && tags.participant_full_id.is_none() {
                return Err(IngestError::decode(
                    path,
                    format!(
                        "no '{}' column and none in the file name",
                        PARTICIPANT_FULL_ID_COLUMN
                    ),
                ));
            }
            acc.merge(&table, parsed.rows, &tags)?;
        }
    }
    Ok(stats)
}

/// Drives ingestion of date folders
pub struct Orchestrator {
    config: IngestConfig,
    whitelist: Arc<TableWhitelist>,
    registry: Arc<ExtractorRegistry>,
    publisher: Publisher,
}

impl Orchestrator {
    pub fn new(config: IngestConfig, whitelist: TableWhitelist, publisher: Publisher) -> Self {
        Self {
            config,
            whitelist: Arc::new(whitelist),
            registry: Arc::new(ExtractorRegistry::builtin()),
            publisher,
        }
    }

    /// Validate `config`, load its whitelist and wire the local sink and catalog
    pub fn from_config(config: IngestConfig) -> Result<Self, IngestError> {
        config.validate()?;
        let whitelist = TableWhitelist::load(&config.whitelist_path)?;
        let sink = LocalParquetSink::new(&config.storage_root)?;
        let catalog = JsonFileCatalog::new(config.catalog_dir()?);
        let publisher = Publisher::new(Arc::new(sink), Arc::new(catalog)).with_retry(config.retry);
        Ok(Self::new(config, whitelist, publisher))
    }

    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn whitelist(&self) -> &TableWhitelist {
        &self.whitelist
    }

    /// Ingest every participant folder under `date_dir` and publish the result
    pub fn ingest_date_folder(&self, date_dir: &Path) -> Result<DateIngestReport, IngestError> {
        let started = Instant::now();
        let date = date_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let span = date_span(&date);
        let _enter = span.enter();

        if !date_dir.is_dir() {
            return Err(IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("date folder {} does not exist", date_dir.display()),
            )));
        }
        info!(path = %date_dir.display(), "Ingesting date folder");

        let mut folder_skips = Vec::new();
        let (jobs, folders_scanned) = self.collect_jobs(date_dir, &mut folder_skips)?;
        debug!(files = jobs.len(), folders = folders_scanned, "Collected source files");

        let extractors = route_avro_signals(&self.registry, &self.whitelist);
        let template = BatchAccumulator::new(Arc::clone(&self.whitelist));
        let parent = Span::current();
        let decoded = parallel_map(&jobs, self.config.max_workers, |job| {
            let _enter = parent.enter();
            let mut acc = template.fork();
            decode_file(&job.path, job.category, &job.device_id, &extractors, &mut acc)
                .map(|stats| (stats, acc))
        });

        let mut folder_acc = template.fork();
        let mut file_failures = Vec::new();
        let mut files_ingested = 0;
        let mut records_skipped = 0;
        for (job, result) in jobs.iter().zip(decoded) {
            let outcome = result.and_then(|(stats, acc)| folder_acc.absorb(acc).map(|_| stats));
            match outcome {
                Ok(stats) => {
                    files_ingested += 1;
                    records_skipped += stats.records_skipped;
                    debug!(path = %job.path.display(), records = stats.records, rows = stats.rows, "Decoded file");
                }
                Err(e) => {
                    error!(path = %job.path.display(), error = %e, "Discarding file");
                    file_failures.push(FileFailure {
                        path: job.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let tables: Vec<_> = folder_acc.into_tables().into_iter().collect();
        let reports = parallel_map(&tables, self.config.max_workers, |(name, rows)| {
            let _enter = parent.enter();
            self.publisher.publish(&PublishRequest {
                rows,
                table: name,
                database: &self.config.database,
                partition_cols: &self.config.partition_cols,
                mode: self.config.mode,
            })
        });

        let status = RunStatus::aggregate(&reports);
        let elapsed = started.elapsed();
        info!(
            tables = reports.len(),
            files = files_ingested,
            failed_files = file_failures.len(),
            skipped_folders = folder_skips.len(),
            ingested = status.is_ingested(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Date folder done"
        );

        Ok(DateIngestReport {
            run_id: Uuid::new_v4(),
            date,
            folders_scanned,
            files_ingested,
            records_skipped,
            folder_skips,
            file_failures,
            tables: reports,
            status,
            elapsed,
        })
    }

    /// Ingest every date folder under `source_root` newer than `cutoff` and
    /// not yet in `ledger`, recording the ones that succeed
    pub fn sync_dates(
        &self,
        source_root: &Path,
        ledger: &mut dyn IngestionLedger,
        cutoff: Option<NaiveDate>,
    ) -> Result<SyncReport, IngestError> {
        let mut report = SyncReport::default();
        let mut dates = Vec::new();
        for (name, path) in sorted_subdirs(source_root)? {
            match NaiveDate::parse_from_str(&name, DATE_FOLDER_FORMAT) {
                Ok(date) => dates.push((date, path)),
                Err(_) => {
                    warn!(entry = %name, "Ignoring entry that is not a date folder");
                    report.ignored.push(name);
                }
            }
        }
        dates.sort();

        for (date, path) in dates {
            if cutoff.is_some_and(|c| date <= c) {
                debug!(%date, "Skipping date at or before cutoff");
                report.before_cutoff.push(date);
                continue;
            }
            if ledger.contains(date) {
                debug!(%date, "Skipping date already ingested");
                report.already_ingested.push(date);
                continue;
            }

            match self.ingest_date_folder(&path) {
                Ok(date_report) => {
                    if date_report.is_ingested() {
                        ledger.record(date)?;
                        report.ingested.push(date);
                    } else {
                        warn!(%date, "Date folder not fully published; it will be retried");
                        report.failed.push(date);
                    }
                    report.reports.push(date_report);
                }
                Err(e) => {
                    error!(%date, error = %e, "Date folder failed");
                    report.failed.push(date);
                }
            }
        }

        info!(
            ingested = report.ingested.len(),
            failed = report.failed.len(),
            already_ingested = report.already_ingested.len(),
            before_cutoff = report.before_cutoff.len(),
            "Sync done"
        );
        Ok(report)
    }

    fn collect_jobs(
        &self,
        date_dir: &Path,
        folder_skips: &mut Vec<FolderSkip>,
    ) -> Result<(Vec<FileJob>, usize), IngestError> {
        let mut jobs = Vec::new();
        let folders = sorted_subdirs(date_dir)?;
        let scanned = folders.len();

        for (name, folder_path) in folders {
            let span = folder_span(&name);
            let _enter = span.enter();

            let folder = match ParticipantFolder::parse(&name) {
                Ok(folder) => folder,
                Err(e) => {
                    warn!(error = %e, "Skipping folder");
                    folder_skips.push(FolderSkip {
                        folder: name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            debug!(
                participant = %folder.participant_id,
                device = %folder.device_id,
                "Scanning participant folder"
            );

            for category in &self.config.categories {
                let dir = folder_path.join(category.sub_path());
                if !dir.is_dir() {
                    let e = IngestError::MissingSubPath(dir);
                    warn!(category = %category, error = %e, "Skipping category");
                    folder_skips.push(FolderSkip {
                        folder: name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
                for path in sorted_files(&dir, category.extension())? {
                    jobs.push(FileJob {
                        path,
                        category: *category,
                        device_id: folder.device_id.clone(),
                    });
                }
            }
        }
        Ok((jobs, scanned))
    }
}

/// Immediate subdirectories of `dir` as (name, path), sorted by name
fn sorted_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, IngestError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if !name.starts_with('.') {
                dirs.push((name.to_string(), path.clone()));
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Files in `dir` with the given extension, sorted
fn sorted_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, IngestError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Apply `f` to every item on at most `workers` scoped threads
///
/// Results are returned in item order.
fn parallel_map<T, R, F>(items: &[T], workers: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = workers.clamp(1, items.len().max(1));
    if workers == 1 {
        return items.iter().map(f).collect();
    }

    let next = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<R>>> = items.iter().map(|_| Mutex::new(None)).collect();
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(i) else { break };
                let result = f(item);
                if let Ok(mut slot) = slots[i].lock() {
                    *slot = Some(result);
                }
            });
        }
    });

    slots
        .into_iter()
        .filter_map(|slot| slot.into_inner().ok().flatten())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::fixtures::{raw_record, write_avro};
    use crate::ledger::MemoryLedger;
    use crate::types::PhaseStatus;
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};

    fn participant_dir(date_dir: &Path, folder: &str) -> PathBuf {
        let dir = date_dir.join(folder).join("raw_data/v6");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn orchestrator(out: &TempDir, tables: &[&str], workers: usize) -> Orchestrator {
        let mut config = IngestConfig::new(out.path().join("data").to_str().unwrap(), "study");
        config.max_workers = workers;
        config.categories = vec![DataCategory::RawAvro];
        let sink = LocalParquetSink::new(&config.storage_root).unwrap();
        let catalog = JsonFileCatalog::new(config.catalog_dir().unwrap());
        let publisher = Publisher::new(Arc::new(sink), Arc::new(catalog));
        Orchestrator::new(config, TableWhitelist::new(tables.iter().copied()), publisher)
    }

    #[test]
    fn test_parse_participant_folder() {
        assert_eq!(
            ParticipantFolder::parse("P001-D007").unwrap(),
            ParticipantFolder {
                participant_id: "P001".to_string(),
                device_id: "D007".to_string(),
            }
        );
        assert_eq!(
            ParticipantFolder::parse("P001-D007-B").unwrap().device_id,
            "D007-B"
        );
        for bad in ["P001D007", "-D007", "P001-"] {
            assert!(matches!(
                ParticipantFolder::parse(bad),
                Err(IngestError::MalformedFolderName(_))
            ));
        }
    }

    #[test]
    fn test_parallel_map_keeps_order() {
        let items: Vec<usize> = (0..50).collect();
        let doubled = parallel_map(&items, 4, |i| i * 2);
        assert_eq!(doubled, items.iter().map(|i| i * 2).collect::<Vec<_>>());
        assert!(parallel_map(&Vec::<usize>::new(), 4, |i| *i).is_empty());
    }

    #[test]
    fn test_ingest_date_folder() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let date_dir = src.path().join("2024-01-15");

        let good = participant_dir(&date_dir, "P001-D007");
        write_avro(
            &good.join("a.avro"),
            vec![raw_record("P001", 0, &[0, 1_000_000_000, 2_000_000_000], &[0.1, 0.2])],
        );
        fs::write(good.join("broken.avro"), b"not avro").unwrap();
        fs::create_dir_all(date_dir.join("P002D008")).unwrap();

        let orch = orchestrator(&out, &["raw_ibi"], 2);
        let report = orch.ingest_date_folder(&date_dir).unwrap();

        assert_eq!(report.date, "2024-01-15");
        assert_eq!(report.folders_scanned, 2);
        assert_eq!(report.files_ingested, 1);
        assert_eq!(report.file_failures.len(), 1);
        assert_eq!(report.folder_skips.len(), 1);
        assert_eq!(report.tables.len(), 1);
        assert_eq!(report.tables[0].table, "raw_ibi");
        assert_eq!(report.tables[0].rows, 2);
        assert_eq!(report.status.storage, PhaseStatus::Succeeded);
        assert!(report.is_ingested());
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let src = tempdir().unwrap();
        let date_dir = src.path().join("2024-01-15");
        for (i, folder) in ["P001-D1", "P002-D2", "P003-D3"].iter().enumerate() {
            let dir = participant_dir(&date_dir, folder);
            for f in 0..3 {
                let peaks: Vec<i64> = (0..=(f + i as i64 + 1)).map(|k| k * 900_000_000).collect();
                write_avro(
                    &dir.join(format!("{}.avro", f)),
                    vec![raw_record(&format!("P00{}", i + 1), 0, &peaks, &[])],
                );
            }
        }

        let collect = |workers: usize| {
            let out = tempdir().unwrap();
            let orch = orchestrator(&out, &["raw_ibi"], workers);
            let jobs = orch.collect_jobs(&date_dir, &mut Vec::new()).unwrap().0;
            let extractors = route_avro_signals(&orch.registry, &orch.whitelist);
            let template = BatchAccumulator::new(Arc::clone(&orch.whitelist));
            let decoded = parallel_map(&jobs, workers, |job| {
                let mut acc = template.fork();
                decode_file(&job.path, job.category, &job.device_id, &extractors, &mut acc)
                    .map(|_| acc)
                    .unwrap()
            });
            let mut folder = template.fork();
            for acc in decoded {
                folder.absorb(acc).unwrap();
            }
            folder.table("raw_ibi").unwrap().clone()
        };

        let sequential = collect(1);
        let parallel = collect(4);
        assert_eq!(sequential, parallel);
        assert_eq!(sequential.sorted_rows(), collect(1).sorted_rows());
    }

    #[test]
    fn test_sync_dates_honours_cutoff_and_ledger() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        for date in ["2024-01-14", "2024-01-15", "2024-01-16"] {
            let dir = participant_dir(&src.path().join(date), "P001-D007");
            write_avro(
                &dir.join("a.avro"),
                vec![raw_record("P001", 0, &[0, 1_000_000_000], &[])],
            );
        }
        fs::create_dir_all(src.path().join("notes")).unwrap();

        let orch = orchestrator(&out, &["raw_ibi"], 1);
        let mut ledger = MemoryLedger::new();
        let cutoff = NaiveDate::from_ymd_opt(2024, 1, 14);

        let first = orch.sync_dates(src.path(), &mut ledger, cutoff).unwrap();
        assert_eq!(first.ingested.len(), 2);
        assert_eq!(first.before_cutoff.len(), 1);
        assert_eq!(first.ignored, vec!["notes".to_string()]);
        assert!(first.is_success());

        let second = orch.sync_dates(src.path(), &mut ledger, cutoff).unwrap();
        assert!(second.ingested.is_empty());
        assert_eq!(second.already_ingested.len(), 2);
    }

    #[test]
    fn test_missing_date_folder_is_error() {
        let out = tempdir().unwrap();
        let orch = orchestrator(&out, &["raw_ibi"], 1);
        assert!(orch.ingest_date_folder(&out.path().join("2030-01-01")).is_err());
    }
}
