//! Schema Capture Model
//!
//! A capture is one observed column layout of a dataset at one point in time.
//! Captures are immutable once a store has accepted them.

use crate::error::{validation_error, AppError};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Printable characters only; no whitespace at either end.
static DATASET_KEY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s\p{Cc}](?:[^\p{Cc}]*[^\s\p{Cc}])?$").expect("dataset key pattern is valid")
});

const MAX_DATASET_KEY_LEN: usize = 255;

/// Stable identifier of a monitored dataset, e.g. `warehouse:public.orders`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetKey(String);

impl DatasetKey {
    pub fn new(key: impl Into<String>) -> Result<Self, AppError> {
        let key = key.into();
        if key.is_empty() {
            return Err(validation_error("Dataset key must not be empty"));
        }
        if key.chars().count() > MAX_DATASET_KEY_LEN {
            return Err(validation_error(format!(
                "Dataset key exceeds {} characters",
                MAX_DATASET_KEY_LEN
            )));
        }
        if !DATASET_KEY_PATTERN.is_match(&key) {
            return Err(validation_error(format!("Invalid dataset key '{}'", key)));
        }
        Ok(Self(key))
    }

    /// Key for a table reached through a named source connection
    pub fn for_table(source: &str, schema: &str, table: &str) -> Result<Self, AppError> {
        Self::new(format!("{}:{}.{}", source, schema, table))
    }

    /// Name of the source connection, for keys built by [`DatasetKey::for_table`]
    pub fn source(&self) -> Option<&str> {
        self.0.split_once(':').map(|(source, _)| source)
    }

    /// The `(schema, table)` part of a key built by [`DatasetKey::for_table`].
    /// Keys without a source prefix are read as `schema.table`.
    pub fn table_ref(&self) -> Option<(&str, &str)> {
        let qualified = self.0.rsplit_once(':').map_or(self.0.as_str(), |(_, t)| t);
        qualified.split_once('.')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DatasetKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DatasetKey> for String {
    fn from(key: DatasetKey) -> Self {
        key.0
    }
}

/// Store-assigned capture identifier; strictly increasing in append order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureId(pub u64);

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One column as reported by the capture source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

/// A capture that has not been accepted by a store yet
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub dataset_key: DatasetKey,
    pub columns: Vec<ColumnSpec>,
    /// Defaults to the append time when absent
    pub captured_at: Option<DateTime<Utc>>,
}

impl NewCapture {
    pub fn new(dataset_key: DatasetKey, columns: Vec<ColumnSpec>) -> Self {
        Self {
            dataset_key,
            columns,
            captured_at: None,
        }
    }

    pub fn at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = Some(captured_at);
        self
    }

    /// Reject duplicate column names
    pub fn validate(&self) -> Result<(), AppError> {
        let mut seen = HashSet::with_capacity(self.columns.len());
        for column in &self.columns {
            if column.name.is_empty() {
                return Err(validation_error(format!(
                    "Capture for {} contains a column with an empty name",
                    self.dataset_key
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(validation_error(format!(
                    "Capture for {} contains duplicate column '{}'",
                    self.dataset_key, column.name
                )));
            }
        }
        Ok(())
    }

    /// Turn into a stored capture. Callers validate first.
    pub(crate) fn into_capture(self, id: CaptureId, now: DateTime<Utc>) -> SchemaCapture {
        let checksum = SchemaCapture::compute_checksum(&self.columns);
        SchemaCapture {
            id,
            dataset_key: self.dataset_key,
            columns: self.columns,
            captured_at: self.captured_at.unwrap_or(now),
            checksum,
        }
    }
}

/// Complete column layout of a dataset at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaCapture {
    pub id: CaptureId,
    pub dataset_key: DatasetKey,
    pub columns: Vec<ColumnSpec>,
    pub captured_at: DateTime<Utc>,
    pub checksum: String,
}

impl SchemaCapture {
    /// Compute checksum from the ordered column list
    pub fn compute_checksum(columns: &[ColumnSpec]) -> String {
        let mut hasher = Sha256::new();
        for col in columns {
            hasher.update(format!("{}:{}:{};", col.name, col.data_type, col.nullable).as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Position in the history: later `captured_at` first, then higher id
    pub fn recency_key(&self) -> (DateTime<Utc>, CaptureId) {
        (self.captured_at, self.id)
    }
}
