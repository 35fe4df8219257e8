// Event bus: events are documents persisted in capped collections

use crate::document::{Document, FieldAccess, Value};
use crate::error::{MongormError, Result};
use crate::schema::SchemaDefinition;
use crate::storage::CappedOptions;
use crate::store::Store;
use std::sync::Arc;

impl Store {
    /// Look up an event schema.
    pub fn event_schema(&self, name: &str) -> Result<Arc<SchemaDefinition>> {
        let schema = self.registry().lookup(name)?;
        if !schema.is_event() {
            return Err(MongormError::Schema(format!("'{name}' is not an event schema")));
        }
        Ok(schema)
    }

    /// Bound applied to an event schema's collection.
    pub fn capped_options(&self, schema: &SchemaDefinition) -> CappedOptions {
        schema.capped.unwrap_or(self.config().default_capped)
    }

    /// Create the capped collection backing an event schema. Idempotent;
    /// call it before starting subscribers so they have a stream to tail.
    pub fn ensure_capped(&self, schema: &str) -> Result<()> {
        let schema = self.event_schema(schema)?;
        let collection = schema.collection_name();

        let mut ready = self
            .capped_ready()
            .lock()
            .map_err(|_| MongormError::Persistence("capped collection cache poisoned".into()))?;
        if ready.contains(collection) {
            return Ok(());
        }
        let options = self.capped_options(&schema);
        self.storage().ensure_capped(collection, &options)?;
        log::debug!("Capped collection '{collection}' ready for '{}' ({options:?})", schema.name);
        ready.insert(collection.to_string());
        Ok(())
    }

    /// A new, unsaved event of the named schema.
    pub fn event(&self, schema: &str) -> Result<Document> {
        Ok(Document::new(self.event_schema(schema)?))
    }

    /// Construct, validate and append an event. Returns the saved event.
    pub fn fire(&self, schema: &str, fields: Vec<(&str, Value)>) -> Result<Document> {
        let mut event = self.event(schema)?;
        for (name, value) in fields {
            event.set(name, value);
        }
        event.save(self)?;
        log::debug!(
            "Fired {} into '{}'",
            schema,
            event.collection()
        );
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::schema::{parse_schemas_str, SchemaRegistry, EVENT_CREATED_AT_FIELD, EVENT_DATA_FIELD};
    use crate::storage::{Filter, Position};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SCHEMA: &str = r#"
settings:
  default_capped: { max_records: 5 }
documents:
  User:
    collection: users
    fields:
      name: { type: string, required: true }
events:
  Signup:
    collection: user_events
    capped: { max_records: 3 }
    fields:
      plan: { type: string, enum: [free, pro], default: free }
  Login:
    collection: user_events
  Ping:
"#;

    fn store() -> Store {
        let file = parse_schemas_str(SCHEMA).unwrap();
        let registry = SchemaRegistry::new();
        registry.register_all(file.schemas).unwrap();
        Store::new(
            Arc::new(crate::storage::MemoryStorage::new()),
            Arc::new(registry),
            file.config,
        )
        .unwrap()
    }

    #[test]
    fn test_ensure_capped_is_idempotent() {
        let store = store();
        store.ensure_capped("Ping").unwrap();
        store.ensure_capped("Ping").unwrap();
        assert!(store.storage().is_capped("Ping").unwrap());
        assert!(matches!(store.ensure_capped("User"), Err(MongormError::Schema(_))));
    }

    #[test]
    fn test_ensure_capped_on_existing_plain_collection_fails() {
        let store = store();
        store
            .storage()
            .insert("Ping", serde_json::Map::new())
            .unwrap();
        assert!(matches!(
            store.ensure_capped("Ping"),
            Err(MongormError::Persistence(_))
        ));
    }

    #[test]
    fn test_fire_sets_base_fields() {
        let store = store();
        let mut user = store.document("User").unwrap().with("name", "Alice");
        user.save(&store).unwrap();

        let event = store
            .fire(
                "Signup",
                vec![
                    ("ref", Value::from(&user)),
                    (EVENT_DATA_FIELD, json!({ "source": "web" }).into()),
                ],
            )
            .unwrap();
        assert!(event.id().is_some());
        assert!(event.get_datetime(EVENT_CREATED_AT_FIELD).is_some());
        assert_eq!(event.get_str("plan"), Some("free"));

        let loaded = store.get("Signup", event.id().unwrap()).unwrap();
        assert_eq!(loaded, event);
        assert_eq!(loaded.resolve("ref").unwrap().get_str("name"), Some("Alice"));
    }

    #[test]
    fn test_fire_blank_event() {
        let store = store();
        let event = store.fire("Ping", vec![]).unwrap();
        assert!(event.get("ref").is_none());
        assert!(store.storage().is_capped("Ping").unwrap());
        assert_eq!(store.storage().last_position("Ping").unwrap(), Position(1));
    }

    #[test]
    fn test_fire_validates() {
        let store = store();
        assert!(matches!(
            store.fire("Signup", vec![("plan", "gold".into())]),
            Err(MongormError::Validation(_))
        ));
        assert!(matches!(
            store.fire("User", vec![]),
            Err(MongormError::Schema(_))
        ));
    }

    #[test]
    fn test_capped_bound_keeps_most_recent() {
        let store = store();
        for n in 0..10 {
            store
                .fire("Ping", vec![(EVENT_DATA_FIELD, Value::Integer(n))])
                .unwrap();
        }
        // Ping declares no bound, so settings.default_capped (5 records) applies.
        let data: Vec<serde_json::Value> = store
            .find("Ping", Filter::new())
            .unwrap()
            .map(|e| e.unwrap().get(EVENT_DATA_FIELD).unwrap().to_json())
            .collect();
        assert_eq!(data, vec![json!(5), json!(6), json!(7), json!(8), json!(9)]);
    }

    #[test]
    fn test_subtypes_share_a_collection() {
        let store = store();
        store.fire("Signup", vec![]).unwrap();
        store.fire("Login", vec![]).unwrap();
        store.fire("Signup", vec![("plan", "pro".into())]).unwrap();

        assert_eq!(store.find("Signup", Filter::new()).unwrap().count(), 2);
        assert_eq!(store.find("Login", Filter::new()).unwrap().count(), 1);

        // The bound belongs to the collection: the oldest Signup is gone.
        store.fire("Login", vec![]).unwrap();
        let remaining: Vec<String> = store
            .storage()
            .find("user_events", &Filter::new())
            .unwrap()
            .iter()
            .map(|r| r["_type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(remaining, vec!["Login", "Signup", "Login"]);
    }

    #[test]
    fn test_dangling_event_ref() {
        let store = store();
        let mut user = store.document("User").unwrap().with("name", "Alice");
        user.save(&store).unwrap();
        let event = store.fire("Ping", vec![("ref", Value::from(&user))]).unwrap();
        user.delete(&store).unwrap();

        let loaded = store.get("Ping", event.id().unwrap()).unwrap();
        assert!(matches!(
            loaded.resolve("ref"),
            Err(MongormError::Decode(DecodeError::DanglingReference { .. }))
        ));
    }
}
