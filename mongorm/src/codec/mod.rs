//! Mapping between live documents and stored records.
//!
//! Encoding validates every field first and fails with the aggregated
//! [`ValidationErrors`](crate::validation::ValidationErrors). Decoding picks
//! the schema from the record's `_type`, applies defaults for missing fields,
//! ignores undeclared ones, and turns stored references into handles bound to
//! the store. Under [`ReferencePolicy::Eager`] the referenced documents are
//! fetched one level deep while decoding.

use crate::config::ReferencePolicy;
use crate::document::{
    parse_datetime, Document, EmbeddedDocument, FieldAccess, Reference, Value, REF_COLLECTION_KEY,
    REF_ID_KEY,
};
use crate::error::{DecodeError, MongormError, Result};
use crate::schema::{FieldType, SchemaDefinition, SchemaKind};
use crate::storage::{ObjectId, Record, ID_KEY, TYPE_KEY};
use crate::store::Store;
use crate::validation::validate_fields;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Encoder/decoder bound to a store (for schema lookup and reference binding).
pub struct Codec<'s> {
    store: &'s Store,
    policy: ReferencePolicy,
}

impl<'s> Codec<'s> {
    pub fn new(store: &'s Store) -> Self {
        Codec {
            store,
            policy: store.config().reference_policy,
        }
    }

    pub fn with_policy(mut self, policy: ReferencePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate a document and produce its coerced field values plus the
    /// record to store.
    pub fn encode(&self, doc: &Document) -> Result<(BTreeMap<String, Value>, Record)> {
        let validated = validate_fields(doc.schema(), doc.fields(), self.store.registry())?;
        let normalized = Document::from_parts(doc.schema_arc().clone(), doc.id().cloned(), validated);
        let record = normalized.to_record();
        Ok((normalized.into_fields(), record))
    }

    pub fn encode_embedded(&self, doc: &EmbeddedDocument) -> Result<Record> {
        let validated = validate_fields(doc.schema(), doc.fields(), self.store.registry())?;
        Ok(EmbeddedDocument::from_parts(doc.schema_arc().clone(), validated).to_record())
    }

    /// Decode a stored record. `fallback` is used when the record carries no
    /// `_type`.
    pub fn decode(&self, record: &Record, fallback: Option<&Arc<SchemaDefinition>>) -> Result<Document> {
        let schema = match record.get(TYPE_KEY) {
            Some(serde_json::Value::String(name)) => self.store.registry().lookup(name)?,
            Some(other) => {
                return Err(mismatch("?", TYPE_KEY, format!("expected a schema name, found {other}")))
            }
            None => fallback.cloned().ok_or_else(|| {
                mismatch("?", TYPE_KEY, "record carries no schema name".to_string())
            })?,
        };
        if !schema.is_persistent() {
            return Err(mismatch(
                &schema.name,
                TYPE_KEY,
                "embedded schemas cannot be decoded as documents".to_string(),
            ));
        }

        let id = match record.get(ID_KEY) {
            Some(serde_json::Value::String(id)) => {
                ObjectId::parse(id).map_err(|e| mismatch(&schema.name, ID_KEY, e.to_string()))?
            }
            _ => return Err(mismatch(&schema.name, ID_KEY, "missing identifier".to_string())),
        };

        let fields = self.decode_fields("", &schema, record)?;
        let doc = Document::from_parts(schema, Some(id), fields);

        if self.policy == ReferencePolicy::Eager {
            for value in doc.fields().values() {
                self.resolve_eagerly(value)?;
            }
        }
        Ok(doc)
    }

    fn decode_fields(
        &self,
        prefix: &str,
        schema: &SchemaDefinition,
        record: &Record,
    ) -> Result<BTreeMap<String, Value>> {
        let mut fields = BTreeMap::new();
        for descriptor in &schema.fields {
            let path = join_path(prefix, &descriptor.name);
            match record.get(&descriptor.name).filter(|v| !v.is_null()) {
                Some(json) => {
                    let value = self.decode_value(&schema.name, &path, &descriptor.field_type, json)?;
                    fields.insert(descriptor.name.clone(), value);
                }
                None => {
                    // Missing fields take their default, as on a fresh save.
                    let value = descriptor
                        .validate(None, self.store.registry())
                        .map_err(|issues| {
                            let reason = issues
                                .first()
                                .map(|i| i.kind.to_string())
                                .unwrap_or_else(|| "invalid default".to_string());
                            mismatch(&schema.name, &path, reason)
                        })?;
                    if let Some(value) = value {
                        fields.insert(descriptor.name.clone(), value);
                    }
                }
            }
        }
        Ok(fields)
    }

    fn decode_value(
        &self,
        schema: &str,
        path: &str,
        field_type: &FieldType,
        json: &serde_json::Value,
    ) -> Result<Value> {
        use serde_json::Value as Json;

        let decoded = match (field_type, json) {
            (FieldType::String, Json::String(s)) => Some(Value::String(s.clone())),
            (FieldType::Integer, Json::Number(n)) => n.as_i64().map(Value::Integer),
            (FieldType::Float, Json::Number(n)) => n.as_f64().map(Value::Float),
            (FieldType::Boolean, Json::Bool(b)) => Some(Value::Boolean(*b)),
            (FieldType::Datetime, Json::String(s)) => parse_datetime(s).map(Value::Datetime),
            (FieldType::Object, Json::Object(_)) | (FieldType::Any, _) => Some(Value::Json(json.clone())),
            (FieldType::Embedded(declared), Json::Object(map)) => {
                return self.decode_embedded(schema, path, declared, map)
            }
            (FieldType::Reference(targets), _) => {
                return self.decode_reference(schema, path, targets, json)
            }
            (FieldType::List(items), Json::Array(values)) => {
                let mut out = Vec::with_capacity(values.len());
                for (index, item) in values.iter().enumerate() {
                    out.push(self.decode_value(schema, &format!("{path}[{index}]"), items, item)?);
                }
                Some(Value::List(out))
            }
            _ => None,
        };
        decoded.ok_or_else(|| {
            mismatch(
                schema,
                path,
                format!("expected {field_type}, found {}", json_type(json)),
            )
        })
    }

    fn decode_embedded(
        &self,
        schema: &str,
        path: &str,
        declared: &str,
        map: &Record,
    ) -> Result<Value> {
        let name = map.get(TYPE_KEY).and_then(|v| v.as_str()).unwrap_or(declared);
        if name != declared {
            return Err(mismatch(
                schema,
                path,
                format!("expected embedded '{declared}', found '{name}'"),
            ));
        }
        let embedded = self.store.registry().lookup(name)?;
        if embedded.kind != SchemaKind::Embedded {
            return Err(mismatch(schema, path, format!("'{name}' is not an embedded schema")));
        }
        let fields = self.decode_fields(path, &embedded, map).map_err(|e| match e {
            // Report nested mismatches against the outer document.
            MongormError::Decode(DecodeError::SchemaMismatch { field, reason, .. }) => {
                mismatch(schema, &field, reason)
            }
            other => other,
        })?;
        Ok(Value::Embedded(EmbeddedDocument::from_parts(embedded, fields)))
    }

    fn decode_reference(
        &self,
        schema: &str,
        path: &str,
        targets: &[String],
        json: &serde_json::Value,
    ) -> Result<Value> {
        let hint = match targets {
            [single] => Some(single.clone()),
            _ => None,
        };
        let (collection, id) = match json {
            serde_json::Value::Object(map) => (
                map.get(REF_COLLECTION_KEY)
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                map.get(REF_ID_KEY).and_then(|v| v.as_str()),
            ),
            // Bare identifiers are accepted when the target is unambiguous.
            serde_json::Value::String(id) => (
                match &hint {
                    Some(target) => self
                        .store
                        .registry()
                        .get(target)
                        .map(|s| s.collection_name().to_string()),
                    None => None,
                },
                Some(id.as_str()),
            ),
            _ => (None, None),
        };

        match (collection, id.and_then(|id| ObjectId::parse(id).ok())) {
            (Some(collection), Some(id)) => Ok(Value::Reference(Reference::bound(
                &collection,
                id,
                hint,
                self.store.clone(),
            ))),
            _ => Err(mismatch(
                schema,
                path,
                format!("expected a reference, found {}", json_type(json)),
            )),
        }
    }

    fn resolve_eagerly(&self, value: &Value) -> Result<()> {
        match value {
            Value::Reference(reference) => {
                let target = self.store.dereference_shared(reference)?;
                reference.set_resolved(target);
                Ok(())
            }
            Value::List(items) => items.iter().try_for_each(|item| self.resolve_eagerly(item)),
            Value::Embedded(doc) => doc
                .fields()
                .values()
                .try_for_each(|item| self.resolve_eagerly(item)),
            _ => Ok(()),
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn json_type(json: &serde_json::Value) -> &'static str {
    crate::document::json_type_name(json)
}

fn mismatch(schema: &str, field: &str, reason: String) -> MongormError {
    MongormError::Decode(DecodeError::SchemaMismatch {
        schema: schema.to_string(),
        field: field.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::schema::{parse_schemas_str, SchemaRegistry};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SCHEMA: &str = r#"
embedded:
  Address:
    fields:
      street: { type: string, required: true }
      city: string
documents:
  User:
    collection: users
    fields:
      name: { type: string, required: true }
      age: integer
      score: float
      active: boolean
      born: datetime
      meta: object
      role: { type: string, default: member }
      address: Address
      previous: { type: list, items: Address }
      tags: { type: list, items: string }
      manager: { type: ref, target: User }
      friends: { type: list, items: { type: ref, target: User } }
"#;

    fn store_with(config: StoreConfig) -> Store {
        let registry = SchemaRegistry::new();
        registry
            .register_all(parse_schemas_str(SCHEMA).unwrap().schemas)
            .unwrap();
        Store::new(
            Arc::new(crate::storage::MemoryStorage::new()),
            Arc::new(registry),
            config,
        )
        .unwrap()
    }

    fn store() -> Store {
        store_with(StoreConfig::default())
    }

    fn address(store: &Store, street: &str) -> EmbeddedDocument {
        store.embedded("Address").unwrap().with("street", street)
    }

    #[test]
    fn test_round_trip_all_field_types() {
        let store = store();
        let mut manager = store.document("User").unwrap().with("name", "Boss");
        manager.save(&store).unwrap();

        let mut doc = store
            .document("User")
            .unwrap()
            .with("name", "Alice")
            .with("age", 31)
            .with("score", 9.5)
            .with("active", true)
            .with("born", Utc.with_ymd_and_hms(1990, 5, 17, 8, 30, 0).unwrap())
            .with("meta", json!({ "k": [1, 2] }))
            .with("address", address(&store, "Main"))
            .with("previous", vec![address(&store, "Old"), address(&store, "Older")])
            .with("tags", vec!["a", "b"])
            .with("manager", &manager)
            .with("friends", vec![Value::from(&manager)]);
        doc.save(&store).unwrap();

        let (_, record) = store.codec().encode(&doc).unwrap();
        let decoded = store.codec().decode(&record, None).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn test_encoded_shape() {
        let store = store();
        let doc = store
            .document("User")
            .unwrap()
            .with("name", "Alice")
            .with("address", address(&store, "Main"));
        let (fields, record) = store.codec().encode(&doc).unwrap();
        assert_eq!(
            serde_json::Value::Object(record),
            json!({
                "_type": "User",
                "name": "Alice",
                "role": "member",
                "address": { "_type": "Address", "street": "Main" },
                "previous": [],
                "tags": [],
                "friends": []
            })
        );
        assert_eq!(fields["role"], Value::String("member".into()));
    }

    #[test]
    fn test_decode_ignores_unknown_fields_and_applies_defaults() {
        let store = store();
        let record = json!({ "_type": "User", "_id": "01hx", "name": "Alice", "legacy": 1 });
        let doc = store
            .codec()
            .decode(record.as_object().unwrap(), None)
            .unwrap();
        assert_eq!(doc.get_str("role"), Some("member"));
        assert_eq!(doc.get_list("tags"), Some(&[][..]));
        assert!(doc.get("legacy").is_none());
    }

    #[test]
    fn test_decode_schema_mismatch() {
        let store = store();
        let record = json!({ "_type": "User", "_id": "01hx", "name": "Alice", "age": "old" });
        let err = store
            .codec()
            .decode(record.as_object().unwrap(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            MongormError::Decode(DecodeError::SchemaMismatch { ref field, .. }) if field == "age"
        ));

        let missing = json!({ "_type": "User", "_id": "01hx" });
        let err = store
            .codec()
            .decode(missing.as_object().unwrap(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            MongormError::Decode(DecodeError::SchemaMismatch { ref field, .. }) if field == "name"
        ));
    }

    #[test]
    fn test_decode_nested_mismatch_path() {
        let store = store();
        let record = json!({
            "_type": "User", "_id": "01hx", "name": "A",
            "previous": [{ "street": "x" }, { "city": "y" }]
        });
        let err = store
            .codec()
            .decode(record.as_object().unwrap(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            MongormError::Decode(DecodeError::SchemaMismatch { ref field, .. })
                if field == "previous[1].street"
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let store = store();
        let record = json!({ "_type": "Ghost", "_id": "01hx" });
        assert!(matches!(
            store.codec().decode(record.as_object().unwrap(), None),
            Err(MongormError::UnknownSchema(_))
        ));
    }

    #[test]
    fn test_lazy_reference_resolves_on_access() {
        let store = store();
        let mut boss = store.document("User").unwrap().with("name", "Boss");
        boss.save(&store).unwrap();
        let mut alice = store
            .document("User")
            .unwrap()
            .with("name", "Alice")
            .with("manager", &boss);
        alice.save(&store).unwrap();

        let loaded = store.get("User", alice.id().unwrap()).unwrap();
        let reference = loaded.reference("manager").unwrap();
        assert!(!reference.is_resolved());
        assert_eq!(loaded.resolve("manager").unwrap().get_str("name"), Some("Boss"));
        assert!(reference.is_resolved());
    }

    #[test]
    fn test_lazy_dangling_reference_fails_on_access() {
        let store = store();
        let record = json!({
            "_type": "User", "_id": "01hx", "name": "Alice",
            "manager": { "$ref": "users", "$id": "01missing" }
        });
        let doc = store
            .codec()
            .decode(record.as_object().unwrap(), None)
            .unwrap();
        assert!(matches!(
            doc.resolve("manager"),
            Err(MongormError::Decode(DecodeError::DanglingReference { .. }))
        ));
    }

    #[test]
    fn test_eager_policy() {
        let store = store_with(StoreConfig::default().with_reference_policy(ReferencePolicy::Eager));
        let mut boss = store.document("User").unwrap().with("name", "Boss");
        boss.save(&store).unwrap();
        let mut alice = store
            .document("User")
            .unwrap()
            .with("name", "Alice")
            .with("friends", vec![Value::from(&boss)]);
        alice.save(&store).unwrap();

        let loaded = store.get("User", alice.id().unwrap()).unwrap();
        let friends = loaded.get_list("friends").unwrap();
        assert!(friends[0].as_reference().unwrap().is_resolved());

        let dangling = json!({
            "_type": "User", "_id": "01hy", "name": "Eve",
            "manager": { "$ref": "users", "$id": "01missing" }
        });
        assert!(matches!(
            store.codec().decode(dangling.as_object().unwrap(), None),
            Err(MongormError::Decode(DecodeError::DanglingReference { .. }))
        ));
    }

    #[test]
    fn test_eager_resolution_stops_after_one_level() {
        let store = store_with(StoreConfig::default().with_reference_policy(ReferencePolicy::Eager));
        let mut a = store.document("User").unwrap().with("name", "A");
        a.save(&store).unwrap();
        let mut b = store.document("User").unwrap().with("name", "B").with("manager", &a);
        b.save(&store).unwrap();
        // Cycle: a -> b -> a
        a.set("manager", &b);
        a.save(&store).unwrap();

        let loaded = store.get("User", a.id().unwrap()).unwrap();
        let b_loaded = loaded.resolve("manager").unwrap();
        assert_eq!(b_loaded.get_str("name"), Some("B"));
        assert!(!b_loaded.reference("manager").unwrap().is_resolved());
    }
}
