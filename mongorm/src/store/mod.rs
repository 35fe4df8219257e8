use crate::codec::Codec;
use crate::config::{ReferencePolicy, StoreConfig};
use crate::document::{Document, EmbeddedDocument, FieldAccess, Reference, Value};
use crate::error::{DecodeError, MongormError, Result};
use crate::schema::{parse_schema_file, SchemaDefinition, SchemaKind, SchemaRegistry};
use crate::storage::{Filter, MemoryStorage, ObjectId, Record, SqliteStorage, Storage, TYPE_KEY};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// File name of the schema declarations inside a data directory.
pub const SCHEMA_FILE: &str = "schema.yaml";
/// File name of the SQLite database inside a data directory.
pub const DATABASE_FILE: &str = "_system.db";

/// The main entry point: a schema registry bound to a storage backend.
///
/// `Store` is a cheap handle; clones share the same storage, registry and
/// settings. Decoded references keep a clone so they can fetch their target
/// later.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    storage: Arc<dyn Storage>,
    registry: Arc<SchemaRegistry>,
    config: StoreConfig,
    root: Option<PathBuf>,
    /// Collections already set up as capped by this store
    capped_ready: Mutex<HashSet<String>>,
    /// Live dereferenced documents by `(collection, id)`
    identity: Mutex<HashMap<(String, ObjectId), Weak<Document>>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.inner.root)
            .field("schemas", &self.inner.registry.names())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Store {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<SchemaRegistry>,
        config: StoreConfig,
    ) -> Result<Self> {
        config.check()?;
        registry.check_complete()?;
        Ok(Self::build(storage, registry, config, None))
    }

    /// A store over process memory with default settings.
    pub fn in_memory(registry: Arc<SchemaRegistry>) -> Self {
        Self::build(
            Arc::new(MemoryStorage::new()),
            registry,
            StoreConfig::default(),
            None,
        )
    }

    /// Open a data directory: parses `schema.yaml` (schemas plus the
    /// optional `settings:` block) and opens or creates `_system.db`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(MongormError::Persistence(format!(
                "Data directory does not exist: {}",
                root.display()
            )));
        }

        let schema_path = root.join(SCHEMA_FILE);
        if !schema_path.exists() {
            return Err(MongormError::Schema(format!(
                "{SCHEMA_FILE} not found in {}",
                root.display()
            )));
        }
        let file = parse_schema_file(&schema_path)?;
        let registry = SchemaRegistry::new();
        registry.register_all(file.schemas)?;
        registry.check_complete()?;

        let storage = SqliteStorage::open(&root.join(DATABASE_FILE))?
            .with_poll_interval(file.config.tail_poll_interval());

        log::debug!(
            "Opened store at {} with {} schemas",
            root.display(),
            registry.names().len()
        );
        Ok(Self::build(
            Arc::new(storage),
            Arc::new(registry),
            file.config,
            Some(root),
        ))
    }

    fn build(
        storage: Arc<dyn Storage>,
        registry: Arc<SchemaRegistry>,
        config: StoreConfig,
        root: Option<PathBuf>,
    ) -> Self {
        Store {
            inner: Arc::new(StoreInner {
                storage,
                registry,
                config,
                root,
                capped_ready: Mutex::new(HashSet::new()),
                identity: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    pub fn storage(&self) -> &dyn Storage {
        self.inner.storage.as_ref()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Data directory this store was opened from, if any.
    pub fn root(&self) -> Option<&Path> {
        self.inner.root.as_deref()
    }

    pub(crate) fn capped_ready(&self) -> &Mutex<HashSet<String>> {
        &self.inner.capped_ready
    }

    pub fn codec(&self) -> Codec<'_> {
        Codec::new(self)
    }

    /// Look up a schema that is stored in its own collection.
    pub fn persistent_schema(&self, name: &str) -> Result<Arc<SchemaDefinition>> {
        let schema = self.registry().lookup(name)?;
        if !schema.is_persistent() {
            return Err(MongormError::Schema(format!(
                "'{name}' is an embedded schema and has no collection"
            )));
        }
        Ok(schema)
    }

    /// A new, unsaved document of the named schema.
    pub fn document(&self, schema: &str) -> Result<Document> {
        Ok(Document::new(self.persistent_schema(schema)?))
    }

    /// A new embedded document of the named schema.
    pub fn embedded(&self, schema: &str) -> Result<EmbeddedDocument> {
        let definition = self.registry().lookup(schema)?;
        if definition.kind != SchemaKind::Embedded {
            return Err(MongormError::Schema(format!(
                "'{schema}' is not an embedded schema"
            )));
        }
        Ok(EmbeddedDocument::new(definition))
    }

    /// A new document with fields taken from a JSON object.
    pub fn document_from_json(&self, schema: &str, json: &serde_json::Value) -> Result<Document> {
        let object = json.as_object().ok_or_else(|| {
            MongormError::Schema(format!("Document data must be a JSON object, got {json}"))
        })?;
        let mut doc = self.document(schema)?;
        for (name, value) in object {
            doc.set(name, Value::Json(value.clone()));
        }
        Ok(doc)
    }

    /// Documents of `schema` matching `filter`, decoded as the cursor is consumed.
    pub fn find(&self, schema: &str, filter: Filter) -> Result<Cursor> {
        let schema = self.persistent_schema(schema)?;
        let collection = schema.collection_name();

        // Several schemas can share a collection (event subtypes).
        let filter = if self.registry().schemas_for_collection(collection).len() > 1 {
            filter.eq(TYPE_KEY, schema.name.as_str())
        } else {
            filter
        };
        let records = self.storage().find(collection, &filter)?;
        log::debug!(
            "find {}: {} records match {filter}",
            schema.name,
            records.len()
        );
        Ok(Cursor {
            store: self.clone(),
            schema,
            records: records.into_iter(),
        })
    }

    /// The single first document matching `filter`.
    pub fn find_one(&self, schema: &str, filter: Filter) -> Result<Document> {
        let criteria = filter.to_string();
        let mut cursor = self.find(schema, filter)?;
        match cursor.next() {
            Some(doc) => doc,
            None => Err(MongormError::NotFound {
                collection: cursor.schema.collection_name().to_string(),
                criteria,
            }),
        }
    }

    pub fn get(&self, schema: &str, id: &ObjectId) -> Result<Document> {
        self.find_one(schema, Filter::by_id(id))
    }

    /// Fetch the target of a reference. The record's `_type` picks the schema.
    pub fn dereference(&self, reference: &Reference) -> Result<Document> {
        let id = reference.id().ok_or_else(|| {
            MongormError::InvalidState(format!(
                "cannot dereference {}: the target has no identifier",
                reference.describe()
            ))
        })?;
        let record = self
            .storage()
            .get(reference.collection(), id)?
            .ok_or_else(|| DecodeError::DanglingReference {
                collection: reference.collection().to_string(),
                id: id.to_string(),
            })?;
        let fallback = match reference.schema() {
            Some(name) => self.registry().get(name),
            None => self.single_schema_for(reference.collection()),
        };
        self.codec()
            .with_policy(ReferencePolicy::Lazy)
            .decode(&record, fallback.as_ref())
    }

    /// Fetch the target of a reference as a shared instance. While any
    /// holder keeps it alive, references to the same stored document get the
    /// same `Arc` without another storage round-trip. Writes through this
    /// store drop the cached instance.
    pub fn dereference_shared(&self, reference: &Reference) -> Result<Arc<Document>> {
        let Some(id) = reference.id() else {
            return self.dereference(reference).map(Arc::new);
        };
        let key = (reference.collection().to_string(), id.clone());
        if let Some(doc) = self.identity().get(&key).and_then(Weak::upgrade) {
            return Ok(doc);
        }

        let doc = Arc::new(self.dereference(reference)?);
        let mut identity = self.identity();
        identity.retain(|_, live| live.strong_count() > 0);
        identity.insert(key, Arc::downgrade(&doc));
        Ok(doc)
    }

    fn identity(&self) -> MutexGuard<'_, HashMap<(String, ObjectId), Weak<Document>>> {
        self.inner.identity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn forget(&self, collection: &str, id: &ObjectId) {
        self.identity().remove(&(collection.to_string(), id.clone()));
    }

    /// Decode a tailed record from `collection`, falling back to the
    /// collection's only schema when the record has no `_type`. References
    /// stay lazy whatever the configured policy, so a record whose target
    /// was deleted still decodes and reports the dangling reference on
    /// `resolve`.
    pub(crate) fn decode_tailed(&self, collection: &str, record: &Record) -> Result<Document> {
        let fallback = self.single_schema_for(collection);
        self.codec()
            .with_policy(ReferencePolicy::Lazy)
            .decode(record, fallback.as_ref())
    }

    fn single_schema_for(&self, collection: &str) -> Option<Arc<SchemaDefinition>> {
        let mut schemas = self.registry().schemas_for_collection(collection);
        if schemas.len() == 1 {
            schemas.pop()
        } else {
            None
        }
    }
}

/// Lazily decoding sequence of find results. Not rewindable; issue a new
/// `find` to start over.
pub struct Cursor {
    store: Store,
    schema: Arc<SchemaDefinition>,
    records: std::vec::IntoIter<Record>,
}

impl Cursor {
    /// Records not yet decoded.
    pub fn remaining(&self) -> usize {
        self.records.len()
    }
}

impl Iterator for Cursor {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(self.store.codec().decode(&record, Some(&self.schema)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

fn persistence(action: &str, target: &str, error: MongormError) -> MongormError {
    match error {
        MongormError::Persistence(_) => error,
        other => MongormError::Persistence(format!("{action} {target} failed: {other}")),
    }
}

impl Document {
    /// Validate, encode and write this document: insert when it has no
    /// identifier yet, otherwise replace the stored record. The coerced field
    /// values (defaults included) are written back into `self`.
    pub fn save(&mut self, store: &Store) -> Result<&mut Self> {
        let (fields, record) = store.codec().encode(self)?;
        let collection = self.collection().to_string();

        if self.schema().is_event() {
            store.ensure_capped(&self.schema().name)?;
        }

        match self.id().cloned() {
            None => {
                let id = store
                    .storage()
                    .insert(&collection, record)
                    .map_err(|e| persistence("insert into", &collection, e))?;
                log::debug!("Inserted {collection}/{id}");
                self.set_id(Some(id));
            }
            Some(id) => {
                store
                    .storage()
                    .replace(&collection, &id, record)
                    .map_err(|e| persistence("replace", &format!("{collection}/{id}"), e))?;
                store.forget(&collection, &id);
                log::debug!("Replaced {collection}/{id}");
            }
        }
        *self.fields_mut() = fields;
        Ok(self)
    }

    /// Remove the stored record. The identifier is cleared, so a later
    /// `save` inserts a new record.
    pub fn delete(&mut self, store: &Store) -> Result<()> {
        let id = self.id().cloned().ok_or_else(|| {
            MongormError::Persistence(format!(
                "Cannot delete a '{}' document that was never saved",
                self.schema().name
            ))
        })?;
        let collection = self.collection().to_string();
        store
            .storage()
            .delete(&collection, &id)
            .map_err(|e| persistence("delete", &format!("{collection}/{id}"), e))?;
        store.forget(&collection, &id);
        log::debug!("Deleted {collection}/{id}");
        self.set_id(None);
        Ok(())
    }
}
