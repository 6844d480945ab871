//! Schema catalog
//!
//! Keeps one table definition per published canonical table so the datasets
//! written by a [`crate::storage::DatasetSink`] can be queried by name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::IngestError;
use crate::types::{ColumnType, PublishMode, RowSet};

/// One column of a table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Catalog type name: `bigint`, `double`, `string` or `timestamp`
    #[serde(rename = "type")]
    pub column_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
        }
    }
}

/// Catalog entry for one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub database: String,
    pub name: String,
    pub location: String,
    pub format: String,
    /// Data columns, excluding partition keys
    pub columns: Vec<ColumnDef>,
    pub partition_keys: Vec<ColumnDef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TableDefinition {
    /// Definition describing `rows` stored at `location`
    pub fn from_rows(
        database: &str,
        name: &str,
        location: &str,
        rows: &RowSet,
        partition_cols: &[String],
    ) -> Self {
        let schema = rows.schema();
        let def = |(col, ty): &(String, ColumnType)| ColumnDef::new(col, ty.catalog_type());

        let columns = schema
            .iter()
            .filter(|(col, _)| !partition_cols.contains(col))
            .map(def)
            .collect();
        let partition_keys = partition_cols
            .iter()
            .map(|key| {
                schema
                    .iter()
                    .find(|(col, _)| col == key)
                    .map(def)
                    .unwrap_or_else(|| ColumnDef::new(key, "string"))
            })
            .collect();

        let now = Utc::now();
        Self {
            database: database.to_string(),
            name: name.to_string(),
            location: location.to_string(),
            format: "parquet".to_string(),
            columns,
            partition_keys,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Registered types of data columns and partition keys
    pub fn column_types(&self) -> Result<Vec<(String, ColumnType)>, IngestError> {
        self.columns
            .iter()
            .chain(&self.partition_keys)
            .map(|c| {
                ColumnType::from_catalog_type(&c.column_type)
                    .map(|ty| (c.name.clone(), ty))
                    .ok_or_else(|| IngestError::SchemaMismatch {
                        table: self.name.clone(),
                        reason: format!(
                            "column '{}' has unknown catalog type '{}'",
                            c.name, c.column_type
                        ),
                    })
            })
            .collect()
    }

    /// Append columns of `incoming` not yet defined; returns the added names
    fn extend_with(&mut self, incoming: &TableDefinition) -> Vec<String> {
        let mut added = Vec::new();
        for column in &incoming.columns {
            let known = self.column(&column.name).is_some()
                || self.partition_keys.iter().any(|k| k.name == column.name);
            if !known {
                added.push(column.name.clone());
                self.columns.push(column.clone());
            }
        }
        added
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// What an upsert did to the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogChange {
    Created,
    Unchanged,
    /// Existing definition kept, these columns appended
    Extended(Vec<String>),
    Replaced,
}

/// Store of table definitions
pub trait SchemaCatalog: Send + Sync {
    fn table_exists(&self, database: &str, table: &str) -> Result<bool, IngestError> {
        Ok(self.get_table(database, table)?.is_some())
    }

    fn get_table(&self, database: &str, table: &str)
        -> Result<Option<TableDefinition>, IngestError>;

    /// Register `definition`
    ///
    /// In append mode an existing definition is preserved and only gains new
    /// columns; in overwrite mode it is replaced.
    fn upsert_table(
        &self,
        definition: TableDefinition,
        mode: PublishMode,
    ) -> Result<CatalogChange, IngestError>;
}

/// Catalog kept as JSON documents under `<root>/<database>/<table>.json`
#[derive(Debug)]
pub struct JsonFileCatalog {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, database: &str, table: &str) -> PathBuf {
        self.root.join(database).join(format!("{}.json", table))
    }

    /// Names of all tables defined in `database`, sorted
    pub fn list_tables(&self, database: &str) -> Result<Vec<String>, IngestError> {
        let dir = self.root.join(database);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn store(&self, definition: &TableDefinition) -> Result<(), IngestError> {
        let path = self.table_path(&definition.database, &definition.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&temp_path, definition.to_json()?)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

impl SchemaCatalog for JsonFileCatalog {
    fn get_table(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Option<TableDefinition>, IngestError> {
        let path = self.table_path(database, table);
        if !path.is_file() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        Ok(Some(TableDefinition::from_json(&json)?))
    }

    fn upsert_table(
        &self,
        mut definition: TableDefinition,
        mode: PublishMode,
    ) -> Result<CatalogChange, IngestError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| IngestError::CatalogUpdate {
                table: definition.name.clone(),
                reason: "catalog lock poisoned".to_string(),
            })?;

        let existing = self.get_table(&definition.database, &definition.name)?;
        let change = match (existing, mode) {
            (None, _) => {
                self.store(&definition)?;
                CatalogChange::Created
            }
            (Some(current), PublishMode::Overwrite) => {
                definition.created_at = current.created_at;
                self.store(&definition)?;
                CatalogChange::Replaced
            }
            (Some(mut current), PublishMode::Append) => {
                let added = current.extend_with(&definition);
                if added.is_empty() {
                    CatalogChange::Unchanged
                } else {
                    current.updated_at = definition.updated_at;
                    self.store(&current)?;
                    CatalogChange::Extended(added)
                }
            }
        };
        Ok(change)
    }
}
