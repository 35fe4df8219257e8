//! Storage collaborator: the capability set the document layer persists through.
//!
//! A [`Storage`] owns named collections of JSON records. Besides plain
//! insert/replace/delete/find it provides the two primitives the event bus is
//! built on: bounded, insertion-ordered *capped* collections and a blocking
//! [`Storage::tail`] read that returns records appended after a [`Position`].

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::{MongormError, Result};
use crate::document::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Record key holding the storage identifier.
pub const ID_KEY: &str = "_id";
/// Record key holding the schema name.
pub const TYPE_KEY: &str = "_type";

/// A stored record: field name to JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Storage-assigned document identifier (lowercase ULID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn generate() -> Self {
        ObjectId(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return Err(MongormError::Persistence(format!(
                "Invalid object id: '{s}'"
            )));
        }
        Ok(ObjectId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = MongormError;

    fn from_str(s: &str) -> Result<Self> {
        ObjectId::parse(s)
    }
}

/// Insertion position within a collection. Strictly increasing per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(pub u64);

impl Position {
    /// Before every record.
    pub const START: Position = Position(0);
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Size bound of a capped collection. Oldest records are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CappedOptions {
    #[serde(default)]
    pub max_records: Option<u64>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

impl CappedOptions {
    pub fn records(max_records: u64) -> Self {
        CappedOptions {
            max_records: Some(max_records),
            max_bytes: None,
        }
    }

    pub fn bytes(max_bytes: u64) -> Self {
        CappedOptions {
            max_records: None,
            max_bytes: Some(max_bytes),
        }
    }

    pub fn check(&self) -> Result<()> {
        match (self.max_records, self.max_bytes) {
            (None, None) => Err(MongormError::Persistence(
                "Capped collection needs max_records or max_bytes".into(),
            )),
            (Some(0), _) | (_, Some(0)) => Err(MongormError::Persistence(
                "Capped collection bounds must be greater than zero".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether a collection holding `records` records of `bytes` total exceeds the bound.
    pub fn is_exceeded(&self, records: u64, bytes: u64) -> bool {
        self.max_records.map_or(false, |max| records > max)
            || self.max_bytes.map_or(false, |max| bytes > max)
    }
}

/// Serialized size of a record, the unit of `max_bytes`.
pub fn record_size(record: &Record) -> u64 {
    serde_json::to_string(record).map(|s| s.len() as u64).unwrap_or(0)
}

/// Equality filter over record fields. Dotted paths reach into nested
/// mappings; an array matches when it contains the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, serde_json::Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    pub fn by_id(id: &ObjectId) -> Self {
        Filter::new().eq(ID_KEY, id.as_str())
    }

    pub fn eq(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((path.to_string(), value.into().to_json()));
        self
    }

    /// Build from a JSON object of `path: value` pairs.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let object = json.as_object().ok_or_else(|| {
            MongormError::Persistence(format!("Filter must be a JSON object, got {json}"))
        })?;
        Ok(Filter {
            conditions: object
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[(String, serde_json::Value)] {
        &self.conditions
    }

    /// The `_id` this filter pins, if any.
    pub fn id(&self) -> Option<&str> {
        self.conditions
            .iter()
            .find(|(path, _)| path == ID_KEY)
            .and_then(|(_, v)| v.as_str())
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|(path, expected)| {
            let segments: Vec<&str> = path.split('.').collect();
            match segments.split_first() {
                Some((head, rest)) => match record.get(*head) {
                    Some(value) => path_matches(value, rest, expected),
                    None => expected.is_null(),
                },
                None => false,
            }
        })
    }
}

fn path_matches(value: &serde_json::Value, segments: &[&str], expected: &serde_json::Value) -> bool {
    use serde_json::Value as Json;
    match segments.split_first() {
        None => match value {
            Json::Array(items) if !expected.is_array() => items.contains(expected),
            _ => value == expected,
        },
        Some((head, rest)) => match value {
            Json::Object(map) => match map.get(*head) {
                Some(inner) => path_matches(inner, rest, expected),
                None => expected.is_null(),
            },
            Json::Array(items) => items
                .iter()
                .any(|item| path_matches(item, segments, expected)),
            _ => false,
        },
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object: serde_json::Map<String, serde_json::Value> =
            self.conditions.iter().cloned().collect();
        write!(f, "{}", serde_json::Value::Object(object))
    }
}

/// Capabilities the document layer consumes from the underlying database.
///
/// Implementations must be safe to share between threads: foreground saves
/// and finds run concurrently with subscriber threads tailing collections.
pub trait Storage: Send + Sync {
    /// Append a record, assigning and returning its identifier.
    /// A record that already carries an `_id` keeps it; duplicates fail.
    fn insert(&self, collection: &str, record: Record) -> Result<ObjectId>;

    /// Replace the record stored under `id`, keeping its position.
    fn replace(&self, collection: &str, id: &ObjectId, record: Record) -> Result<()>;

    fn delete(&self, collection: &str, id: &ObjectId) -> Result<()>;

    /// Records matching `filter`, in insertion order.
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>>;

    fn get(&self, collection: &str, id: &ObjectId) -> Result<Option<Record>> {
        Ok(self.find(collection, &Filter::by_id(id))?.into_iter().next())
    }

    /// Create `collection` as a capped collection. Idempotent for capped
    /// collections; fails for an existing uncapped one.
    fn ensure_capped(&self, collection: &str, options: &CappedOptions) -> Result<()>;

    fn is_capped(&self, collection: &str) -> Result<bool>;

    fn collection_exists(&self, collection: &str) -> Result<bool>;

    /// Position of the most recently appended record, `START` when empty or missing.
    fn last_position(&self, collection: &str) -> Result<Position>;

    /// Records appended after `after`, in order. Blocks up to `wait` when
    /// there are none yet and returns an empty batch on timeout.
    fn tail(&self, collection: &str, after: Position, wait: Duration) -> Result<Vec<(Position, Record)>>;
}
