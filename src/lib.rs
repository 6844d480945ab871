//! Sensorfabric Ingest - biometric export bundles to partitioned, catalogued datasets
//!
//! Wearable exports arrive as one folder per date, holding one folder per
//! participant and device with raw Avro records and per-minute aggregated CSV
//! files. Ingestion is a deterministic pipeline:
//! decode → extract → route → accumulate → publish.
//!
//! ## Modules
//!
//! - **Decoding**: [`decoder`] (Avro object containers), [`aggregated`] (per-minute CSV)
//! - **Extraction**: [`extractors`] turn one decoded record into rows per signal
//! - **Routing**: [`router`] maps sources to canonical tables and applies the whitelist
//! - **Accumulation**: [`accumulator`] builds one table per canonical name
//! - **Publishing**: [`publisher`] over a [`storage`] sink and a [`catalog`]
//! - **Driving**: [`orchestrator`] walks date folders, [`ledger`] remembers finished dates

pub mod accumulator;
pub mod aggregated;
pub mod catalog;
pub mod config;
pub mod decoder;
pub mod error;
pub mod extractors;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod publisher;
pub mod router;
pub mod schema;
pub mod storage;
pub mod types;

pub use accumulator::{BatchAccumulator, MergeOutcome, SourceTags};
pub use config::{DataCategory, IngestConfig};
pub use error::{IngestError, Result};
pub use orchestrator::{DateIngestReport, Orchestrator, ParticipantFolder, SyncReport};
pub use publisher::{PublishRequest, Publisher, RetryPolicy};
pub use router::TableWhitelist;
pub use types::{PhaseOutcome, PhaseStatus, PublishMode, RowSet, RunStatus, TablePublishReport};

/// Crate version, reported by the CLI
pub const INGEST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "sensorfabric-ingest";
