//! Decoded record representation
//!
//! A decoded record is a nested key/value tree. Known envelope fields
//! (enrollment, timezone, algorithm version) get typed accessors; signal
//! payloads are reached through dotted paths.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IngestError;

/// Top-level field holding enrollment identity
pub const ENROLLMENT_FIELD: &str = "enrollment";
/// Top-level field holding the timezone offset in seconds
pub const TIMEZONE_FIELD: &str = "timezone";
/// Top-level field holding the algorithm version tag
pub const ALGO_VERSION_FIELD: &str = "algoVersion";

/// Enrollment identity carried by every record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    #[serde(rename = "organizationID")]
    pub organization_id: String,
    #[serde(rename = "siteID")]
    pub site_id: String,
    #[serde(rename = "studyID")]
    pub study_id: String,
    #[serde(rename = "participantID")]
    pub participant_id: String,
}

impl Enrollment {
    /// Composite `{organization}-{site}-{study}-{participant}` identifier
    pub fn participant_full_id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.organization_id, self.site_id, self.study_id, self.participant_id
        )
    }
}

/// One unit of raw sensor output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecodedRecord {
    root: Value,
}

impl DecodedRecord {
    /// Wrap a decoded value; the root must be an object
    pub fn new(root: Value) -> Result<Self, IngestError> {
        if !root.is_object() {
            return Err(IngestError::InvalidRecord(format!(
                "record root must be an object, got {}",
                type_name(&root)
            )));
        }
        Ok(Self { root })
    }

    /// Parse a record from JSON text
    pub fn from_json(json: &str) -> Result<Self, IngestError> {
        Self::new(serde_json::from_str(json)?)
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Value at a dotted path such as `rawData.systolicPeaks.peaksTimeNanos`
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.root, |node, key| node.as_object()?.get(key))
            .filter(|v| !v.is_null())
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get_path(path).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get_path(path).and_then(Value::as_f64)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get_path(path).and_then(Value::as_str)
    }

    /// Integer array at `path`; `Some(Err)` if any element is not an integer
    pub fn get_i64_array(&self, path: &str) -> Option<Result<Vec<i64>, IngestError>> {
        let items = self.get_path(path)?.as_array()?;
        Some(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.as_i64().ok_or_else(|| {
                        IngestError::InvalidRecord(format!("{}[{}] is not an integer", path, i))
                    })
                })
                .collect(),
        )
    }

    /// Numeric array at `path`; `Some(Err)` if any element is not a number
    pub fn get_f64_array(&self, path: &str) -> Option<Result<Vec<f64>, IngestError>> {
        let items = self.get_path(path)?.as_array()?;
        Some(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.as_f64().ok_or_else(|| {
                        IngestError::InvalidRecord(format!("{}[{}] is not a number", path, i))
                    })
                })
                .collect(),
        )
    }

    /// Enrollment identity; required on every record
    pub fn enrollment(&self) -> Result<Enrollment, IngestError> {
        let value = self
            .get_path(ENROLLMENT_FIELD)
            .ok_or_else(|| IngestError::InvalidRecord("record has no enrollment".to_string()))?;
        let field = |key: &str| -> Result<String, IngestError> {
            match value.get(key) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Number(n)) => Ok(n.to_string()),
                _ => Err(IngestError::InvalidRecord(format!(
                    "enrollment is missing '{}'",
                    key
                ))),
            }
        };
        Ok(Enrollment {
            organization_id: field("organizationID")?,
            site_id: field("siteID")?,
            study_id: field("studyID")?,
            participant_id: field("participantID")?,
        })
    }

    /// Participant full ID derived from the enrollment
    pub fn participant_full_id(&self) -> Result<String, IngestError> {
        Ok(self.enrollment()?.participant_full_id())
    }

    /// Timezone offset in seconds, if present
    pub fn timezone(&self) -> Option<i64> {
        self.get_i64(TIMEZONE_FIELD)
    }

    /// Algorithm version rendered as text; `"null"` when absent
    pub fn algo_version(&self) -> String {
        match self.get_path(ALGO_VERSION_FIELD) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => Value::Null.to_string(),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
