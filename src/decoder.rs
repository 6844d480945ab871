//! Avro record decoder adapter
//!
//! Wraps the Avro object-container reader and yields decoded records lazily,
//! one per Avro datum. The reader is single-pass: once it reports an error it
//! yields nothing further.

use apache_avro::types::Value as AvroValue;
use apache_avro::Reader;
use serde_json::{Map, Number, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::error::IngestError;
use crate::schema::DecodedRecord;

/// Lazy iterator over the records of one Avro file
pub struct AvroRecordReader {
    path: PathBuf,
    inner: Reader<'static, BufReader<File>>,
    finished: bool,
}

impl AvroRecordReader {
    /// Open `path` and read the container header
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| IngestError::decode(&path, e))?;
        let inner = Reader::new(BufReader::new(file)).map_err(|e| IngestError::decode(&path, e))?;
        Ok(Self {
            path,
            inner,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for AvroRecordReader {
    type Item = Result<DecodedRecord, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = match self.inner.next()? {
            Ok(value) => DecodedRecord::new(avro_to_json(value))
                .map_err(|e| IngestError::decode(&self.path, e)),
            Err(e) => Err(IngestError::decode(&self.path, e)),
        };
        if item.is_err() {
            self.finished = true;
        }
        Some(item)
    }
}

/// Convert an Avro datum into the generic value tree
///
/// Records and maps become objects, unions are unwrapped, logical types
/// collapse to their underlying number and bytes become arrays of numbers.
pub fn avro_to_json(value: AvroValue) -> Value {
    match value {
        AvroValue::Null => Value::Null,
        AvroValue::Boolean(b) => Value::Bool(b),
        AvroValue::Int(i) | AvroValue::Date(i) | AvroValue::TimeMillis(i) => Value::from(i),
        AvroValue::Long(i)
        | AvroValue::TimeMicros(i)
        | AvroValue::TimestampMillis(i)
        | AvroValue::TimestampMicros(i) => Value::from(i),
        AvroValue::Float(f) => float_value(f as f64),
        AvroValue::Double(f) => float_value(f),
        AvroValue::String(s) | AvroValue::Enum(_, s) => Value::String(s),
        AvroValue::Uuid(u) => Value::String(u.to_string()),
        AvroValue::Bytes(bytes) | AvroValue::Fixed(_, bytes) => {
            Value::Array(bytes.into_iter().map(Value::from).collect())
        }
        AvroValue::Union(_, inner) => avro_to_json(*inner),
        AvroValue::Array(items) => Value::Array(items.into_iter().map(avro_to_json).collect()),
        AvroValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, avro_to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
        AvroValue::Record(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, avro_to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
        other => Value::String(format!("{:?}", other)),
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}
