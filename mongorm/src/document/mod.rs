// Document model: live schema instances and their field values

mod value;

pub use value::{Reference, Value, REF_COLLECTION_KEY, REF_ID_KEY};
pub(crate) use value::{format_datetime, json_type_name, parse_datetime};

use crate::error::{MongormError, Result};
use crate::schema::SchemaDefinition;
use crate::storage::{ObjectId, Record, ID_KEY, TYPE_KEY};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared field access for documents and embedded documents.
pub trait FieldAccess {
    fn schema(&self) -> &SchemaDefinition;

    fn fields(&self) -> &BTreeMap<String, Value>;

    fn fields_mut(&mut self) -> &mut BTreeMap<String, Value>;

    fn get(&self, name: &str) -> Option<&Value> {
        self.fields().get(name).filter(|v| !v.is_null())
    }

    /// Set a field without validating it. Validation happens on save.
    fn set(&mut self, name: &str, value: impl Into<Value>) -> &mut Self
    where
        Self: Sized,
    {
        self.fields_mut().insert(name.to_string(), value.into());
        self
    }

    fn with(mut self, name: &str, value: impl Into<Value>) -> Self
    where
        Self: Sized,
    {
        self.set(name, value);
        self
    }

    fn unset(&mut self, name: &str) -> Option<Value> {
        self.fields_mut().remove(name)
    }

    fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    fn get_datetime(&self, name: &str) -> Option<&DateTime<Utc>> {
        self.get(name).and_then(Value::as_datetime)
    }

    fn get_list(&self, name: &str) -> Option<&[Value]> {
        self.get(name).and_then(Value::as_list)
    }

    fn get_embedded(&self, name: &str) -> Option<&EmbeddedDocument> {
        self.get(name).and_then(Value::as_embedded)
    }

    fn reference(&self, name: &str) -> Option<&Reference> {
        self.get(name).and_then(Value::as_reference)
    }

    /// Resolve the reference stored in `name`, fetching it on first access.
    fn resolve(&self, name: &str) -> Result<Arc<Document>> {
        let reference = self.reference(name).ok_or_else(|| {
            MongormError::InvalidState(format!(
                "field '{}.{name}' does not hold a reference",
                self.schema().name
            ))
        })?;
        reference.resolve()
    }
}

/// A top-level document bound to a collection.
#[derive(Debug, Clone)]
pub struct Document {
    schema: Arc<SchemaDefinition>,
    id: Option<ObjectId>,
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(schema: Arc<SchemaDefinition>) -> Self {
        Document {
            schema,
            id: None,
            fields: BTreeMap::new(),
        }
    }

    pub(crate) fn from_parts(
        schema: Arc<SchemaDefinition>,
        id: Option<ObjectId>,
        fields: BTreeMap<String, Value>,
    ) -> Self {
        Document { schema, id, fields }
    }

    pub fn id(&self) -> Option<&ObjectId> {
        self.id.as_ref()
    }

    pub(crate) fn set_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }

    pub fn collection(&self) -> &str {
        self.schema.collection_name()
    }

    pub fn schema_arc(&self) -> &Arc<SchemaDefinition> {
        &self.schema
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    /// Reference value pointing at this document.
    pub fn to_reference(&self) -> Reference {
        Reference::to(self)
    }

    /// Storage form of the current field values, without validation.
    pub fn to_record(&self) -> Record {
        let mut record = fields_to_record(&self.schema, &self.fields);
        if let Some(id) = &self.id {
            record.insert(ID_KEY.into(), serde_json::Value::String(id.to_string()));
        }
        record
    }
}

impl FieldAccess for Document {
    fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    fn fields_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.fields
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name == other.schema.name && self.id == other.id && self.fields == other.fields
    }
}

/// A document stored inline inside another document.
#[derive(Debug, Clone)]
pub struct EmbeddedDocument {
    schema: Arc<SchemaDefinition>,
    fields: BTreeMap<String, Value>,
}

impl EmbeddedDocument {
    pub fn new(schema: Arc<SchemaDefinition>) -> Self {
        EmbeddedDocument {
            schema,
            fields: BTreeMap::new(),
        }
    }

    pub(crate) fn from_parts(schema: Arc<SchemaDefinition>, fields: BTreeMap<String, Value>) -> Self {
        EmbeddedDocument { schema, fields }
    }

    pub fn schema_arc(&self) -> &Arc<SchemaDefinition> {
        &self.schema
    }

    pub fn to_record(&self) -> Record {
        fields_to_record(&self.schema, &self.fields)
    }
}

impl FieldAccess for EmbeddedDocument {
    fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    fn fields_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.fields
    }
}

impl PartialEq for EmbeddedDocument {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name == other.schema.name && self.fields == other.fields
    }
}

fn fields_to_record(schema: &SchemaDefinition, fields: &BTreeMap<String, Value>) -> Record {
    let mut record = Record::new();
    record.insert(TYPE_KEY.into(), serde_json::Value::String(schema.name.clone()));
    for field in &schema.fields {
        if let Some(value) = fields.get(&field.name).filter(|v| !v.is_null()) {
            record.insert(field.name.clone(), value.to_json());
        }
    }
    record
}
