use super::{Document, EmbeddedDocument, FieldAccess};
use crate::error::{MongormError, Result};
use crate::storage::ObjectId;
use crate::store::Store;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Keys of a stored reference mapping.
pub const REF_COLLECTION_KEY: &str = "$ref";
pub const REF_ID_KEY: &str = "$id";

/// A live field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Datetime(DateTime<Utc>),
    /// Free-form or not yet coerced data
    Json(serde_json::Value),
    Embedded(EmbeddedDocument),
    Reference(Reference),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Json(serde_json::Value::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Datetime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<&EmbeddedDocument> {
        match self {
            Value::Embedded(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::Datetime(_) => "datetime",
            Value::Json(v) => json_type_name(v),
            Value::Embedded(_) => "embedded document",
            Value::Reference(_) => "reference",
            Value::List(_) => "list",
        }
    }

    /// Storage representation of this value.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::String(s) => Json::String(s.clone()),
            Value::Integer(n) => Json::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Boolean(b) => Json::Bool(*b),
            Value::Datetime(dt) => Json::String(format_datetime(dt)),
            Value::Json(v) => v.clone(),
            Value::Embedded(doc) => Json::Object(doc.to_record()),
            Value::Reference(r) => r.to_json(),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_f64() => "float",
        serde_json::Value::Number(_) => "integer",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "object",
    }
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::Datetime(dt)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<EmbeddedDocument> for Value {
    fn from(doc: EmbeddedDocument) -> Self {
        Value::Embedded(doc)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Reference(r)
    }
}

impl From<&Document> for Value {
    fn from(doc: &Document) -> Self {
        Value::Reference(Reference::to(doc))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// Pointer from one document to another, stored as `{"$ref": collection, "$id": id}`.
///
/// Decoded references are lazy: the target is fetched through the store on the
/// first call to [`Reference::resolve`] and cached for the lifetime of the value.
#[derive(Clone)]
pub struct Reference {
    collection: String,
    id: Option<ObjectId>,
    schema: Option<String>,
    resolved: OnceLock<Arc<Document>>,
    store: Option<Store>,
}

impl Reference {
    /// Reference by raw identifier.
    pub fn new(collection: &str, id: ObjectId) -> Self {
        Reference {
            collection: collection.to_string(),
            id: Some(id),
            schema: None,
            resolved: OnceLock::new(),
            store: None,
        }
    }

    /// Reference to a live document. The document itself is kept as the resolved value.
    pub fn to(doc: &Document) -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(Arc::new(doc.clone()));
        Reference {
            collection: doc.collection().to_string(),
            id: doc.id().cloned(),
            schema: Some(doc.schema().name.clone()),
            resolved,
            store: None,
        }
    }

    pub(crate) fn bound(collection: &str, id: ObjectId, schema: Option<String>, store: Store) -> Self {
        Reference {
            collection: collection.to_string(),
            id: Some(id),
            schema,
            resolved: OnceLock::new(),
            store: Some(store),
        }
    }

    pub(crate) fn with_schema(mut self, schema: Option<String>) -> Self {
        if self.schema.is_none() {
            self.schema = schema;
        }
        self
    }

    pub(crate) fn set_resolved(&self, doc: Arc<Document>) {
        let _ = self.resolved.set(doc);
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> Option<&ObjectId> {
        self.id.as_ref()
    }

    /// Schema of the target when known without a fetch.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    pub fn cached(&self) -> Option<&Arc<Document>> {
        self.resolved.get()
    }

    /// Fetch the target through the store this reference was decoded from.
    pub fn resolve(&self) -> Result<Arc<Document>> {
        if let Some(doc) = self.resolved.get() {
            return Ok(doc.clone());
        }
        match &self.store {
            Some(store) => self.resolve_with(store),
            None => Err(MongormError::InvalidState(format!(
                "reference to {} is not bound to a store",
                self.describe()
            ))),
        }
    }

    /// Fetch the target through the given store, caching the result.
    pub fn resolve_with(&self, store: &Store) -> Result<Arc<Document>> {
        if let Some(doc) = self.resolved.get() {
            return Ok(doc.clone());
        }
        let doc = store.dereference_shared(self)?;
        let _ = self.resolved.set(doc);
        self.resolved.get().cloned().ok_or_else(|| {
            MongormError::InvalidState(format!("reference to {} lost its target", self.describe()))
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.id {
            Some(id) => serde_json::json!({
                REF_COLLECTION_KEY: self.collection,
                REF_ID_KEY: id.as_str(),
            }),
            None => serde_json::Value::Null,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("{}/{}", self.collection, id),
            None => format!("{}/<unsaved>", self.collection),
        }
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.collection == other.collection && self.id == other.id
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("collection", &self.collection)
            .field("id", &self.id)
            .field("schema", &self.schema)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_datetime_keeps_subsecond_precision() {
        let dt = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let s = format_datetime(&dt);
        assert_eq!(parse_datetime(&s), Some(dt));
    }

    #[test]
    fn test_reference_json_shape() {
        let id = ObjectId::parse("01hx0000000000000000000000").unwrap();
        let r = Reference::new("users", id);
        assert_eq!(
            r.to_json(),
            serde_json::json!({ "$ref": "users", "$id": "01hx0000000000000000000000" })
        );
    }

    #[test]
    fn test_unbound_reference_cannot_resolve() {
        let r = Reference::new("users", ObjectId::generate());
        assert!(matches!(r.resolve(), Err(MongormError::InvalidState(_))));
    }

    #[test]
    fn test_non_finite_float_encodes_as_null() {
        assert_eq!(Value::Float(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Value::Float(1.5).to_json(), serde_json::json!(1.5));
    }

    #[test]
    fn test_list_from_vec() {
        let v = Value::from(vec!["a", "b"]);
        assert_eq!(
            v,
            Value::List(vec![Value::String("a".into()), Value::String("b".into())])
        );
        assert_eq!(v.to_json(), serde_json::json!(["a", "b"]));
    }
}
