use super::types::{FieldType, SchemaDefinition, SchemaKind};
use crate::error::{MongormError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Schema name to definition. Populated at startup; definitions are immutable
/// once registered. Readers never block each other.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<SchemaDefinition>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<SchemaDefinition>>> {
        self.schemas.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a schema. Fails if the name is taken or the declaration is invalid.
    pub fn register(&self, schema: SchemaDefinition) -> Result<Arc<SchemaDefinition>> {
        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());

        if schemas.contains_key(&schema.name) {
            return Err(MongormError::Schema(format!(
                "Schema '{}' is already registered",
                schema.name
            )));
        }
        check_declaration(&schema, &schemas)?;
        check_dependents(&schema, &schemas)?;
        check_embedding_cycles(&schema, &schemas)?;

        log::debug!(
            "Registered schema '{}' ({:?}, {} fields)",
            schema.name,
            schema.kind,
            schema.fields.len()
        );
        let schema = Arc::new(schema);
        schemas.insert(schema.name.clone(), schema.clone());
        Ok(schema)
    }

    pub fn register_all<I>(&self, schemas: I) -> Result<()>
    where
        I: IntoIterator<Item = SchemaDefinition>,
    {
        for schema in schemas {
            self.register(schema)?;
        }
        Ok(())
    }

    /// Every schema named by an embedded or reference field is registered.
    /// Call once all declarations are in.
    pub fn check_complete(&self) -> Result<()> {
        let schemas = self.read();
        let mut names: Vec<&String> = schemas.keys().collect();
        names.sort();
        for name in names {
            for field in &schemas[name].fields {
                for (target, _) in field_targets(&field.field_type) {
                    if !schemas.contains_key(target) {
                        return Err(MongormError::Schema(format!(
                            "Schema '{name}': field '{}' names unknown schema '{target}'",
                            field.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Look up a registered schema by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<SchemaDefinition>> {
        self.get(name)
            .ok_or_else(|| MongormError::UnknownSchema(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<SchemaDefinition>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered schema names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Persistent schemas stored in `collection`, sorted by name.
    pub fn schemas_for_collection(&self, collection: &str) -> Vec<Arc<SchemaDefinition>> {
        let mut found: Vec<Arc<SchemaDefinition>> = self
            .read()
            .values()
            .filter(|s| s.is_persistent() && s.collection_name() == collection)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }
}

fn check_declaration(
    schema: &SchemaDefinition,
    registered: &HashMap<String, Arc<SchemaDefinition>>,
) -> Result<()> {
    let invalid = |msg: String| MongormError::Schema(format!("Schema '{}': {msg}", schema.name));

    if schema.name.trim().is_empty() {
        return Err(MongormError::Schema("Schema name must not be empty".into()));
    }

    let mut seen = HashSet::new();
    for field in &schema.fields {
        if field.name.is_empty() {
            return Err(invalid("field name must not be empty".into()));
        }
        if field.name.starts_with('_') || field.name.contains('.') || field.name.starts_with('$') {
            return Err(invalid(format!(
                "field name '{}' is reserved",
                field.name
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(invalid(format!("duplicate field '{}'", field.name)));
        }
        if field.enum_values.is_some() && !is_string_like(&field.field_type) {
            return Err(invalid(format!(
                "enum values on non-string field '{}'",
                field.name
            )));
        }
        for (target, embedded) in field_targets(&field.field_type) {
            // A schema may name itself; it is not registered yet.
            let target = match registered.get(target) {
                Some(found) => &**found,
                None if target == schema.name => schema,
                None => continue,
            };
            if let Some(problem) = target_mismatch(&field.name, target, embedded) {
                return Err(invalid(problem));
            }
        }
    }

    match schema.kind {
        SchemaKind::Embedded => {
            if schema.collection.is_some() || schema.capped.is_some() {
                return Err(invalid("embedded schemas have no collection".into()));
            }
        }
        SchemaKind::Document => {
            if schema.capped.is_some() {
                return Err(invalid("only event schemas may be capped".into()));
            }
        }
        SchemaKind::Event => {
            if let Some(capped) = &schema.capped {
                capped.check().map_err(|e| invalid(e.to_string()))?;
            }
        }
    }

    if schema.is_persistent() {
        if schema.collection_name().trim().is_empty() {
            return Err(invalid("collection name must not be empty".into()));
        }
        let clash = registered.values().find(|other| {
            other.is_persistent()
                && other.collection_name() == schema.collection_name()
                && other.is_event() != schema.is_event()
        });
        if let Some(other) = clash {
            return Err(invalid(format!(
                "collection '{}' is shared with '{}' but only one of them is an event schema",
                schema.collection_name(),
                other.name
            )));
        }
    }

    Ok(())
}

fn is_string_like(field_type: &FieldType) -> bool {
    match field_type {
        FieldType::String => true,
        FieldType::List(items) => is_string_like(items),
        _ => false,
    }
}

/// Schemas named by a field type, with `true` for inline embedding and
/// `false` for references.
fn field_targets(field_type: &FieldType) -> Vec<(&str, bool)> {
    match field_type {
        FieldType::Embedded(name) => vec![(name.as_str(), true)],
        FieldType::Reference(targets) => targets.iter().map(|t| (t.as_str(), false)).collect(),
        FieldType::List(items) => field_targets(items),
        _ => Vec::new(),
    }
}

fn target_mismatch(field: &str, target: &SchemaDefinition, embedded: bool) -> Option<String> {
    if embedded && target.kind != SchemaKind::Embedded {
        Some(format!(
            "field '{field}' embeds '{}', which is not an embedded schema",
            target.name
        ))
    } else if !embedded && !target.is_persistent() {
        Some(format!(
            "field '{field}' references '{}', which is an embedded schema",
            target.name
        ))
    } else {
        None
    }
}

/// Fields of already registered schemas that point at `schema` by name.
/// Catches declarations that were accepted before their target existed.
fn check_dependents(
    schema: &SchemaDefinition,
    registered: &HashMap<String, Arc<SchemaDefinition>>,
) -> Result<()> {
    for other in registered.values() {
        for field in &other.fields {
            for (target, embedded) in field_targets(&field.field_type) {
                if target != schema.name {
                    continue;
                }
                if let Some(problem) = target_mismatch(&field.name, schema, embedded) {
                    return Err(MongormError::Schema(format!(
                        "Schema '{}': {problem}",
                        other.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Inline embedding must form a DAG, otherwise encoding never terminates.
/// References are stored by identifier and may be cyclic.
fn check_embedding_cycles(
    schema: &SchemaDefinition,
    registered: &HashMap<String, Arc<SchemaDefinition>>,
) -> Result<()> {
    let mut stack: Vec<Vec<String>> = schema
        .embedded_dependencies()
        .into_iter()
        .map(|dep| vec![schema.name.clone(), dep.to_string()])
        .collect();
    let mut visited = HashSet::new();

    while let Some(path) = stack.pop() {
        let Some(current) = path.last() else { continue };
        if *current == schema.name {
            return Err(MongormError::Schema(format!(
                "Embedding cycle: {}",
                path.join(" -> ")
            )));
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(next) = registered.get(current) {
            for dep in next.embedded_dependencies() {
                let mut extended = path.clone();
                extended.push(dep.to_string());
                stack.push(extended);
            }
        }
    }
    Ok(())
}
