use super::types::{FieldDescriptor, FieldType, SchemaDefinition};
use crate::config::StoreConfig;
use crate::document::Value;
use crate::error::{MongormError, Result};
use crate::storage::CappedOptions;
use serde::Deserialize;
use std::path::Path;

/// Parsed `schema.yaml`: store settings plus schema declarations, embedded
/// schemas first so that documents can embed them.
#[derive(Debug, Clone)]
pub struct SchemaFile {
    pub config: StoreConfig,
    pub schemas: Vec<SchemaDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSchemaFile {
    #[serde(default)]
    settings: StoreConfig,
    #[serde(default)]
    embedded: serde_yaml::Mapping,
    #[serde(default)]
    documents: serde_yaml::Mapping,
    #[serde(default)]
    events: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSchema {
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    capped: Option<CappedOptions>,
    #[serde(default)]
    fields: serde_yaml::Mapping,
}

/// A field entry, either `name: type` or a full mapping.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawField {
    Simple(String),
    Full(Box<RawFieldDefinition>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFieldDefinition {
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<serde_yaml::Value>,
    #[serde(rename = "enum", default)]
    enum_values: Option<Vec<String>>,
    #[serde(default)]
    target: Option<RefTarget>,
    #[serde(default)]
    items: Option<RawField>,
    #[serde(default)]
    auto: Option<AutoValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RefTarget {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AutoValue {
    Now,
}

/// Parse a schema.yaml file
pub fn parse_schema_file(path: &Path) -> Result<SchemaFile> {
    let content = std::fs::read_to_string(path)?;
    parse_schemas_str(&content)
}

/// Parse schema YAML from a string
pub fn parse_schemas_str(content: &str) -> Result<SchemaFile> {
    let raw: RawSchemaFile = if content.trim().is_empty() {
        RawSchemaFile {
            settings: StoreConfig::default(),
            embedded: serde_yaml::Mapping::new(),
            documents: serde_yaml::Mapping::new(),
            events: serde_yaml::Mapping::new(),
        }
    } else {
        serde_yaml::from_str(content)?
    };
    raw.settings.check()?;

    let mut schemas = Vec::new();
    for (section, entries) in [
        ("embedded", &raw.embedded),
        ("documents", &raw.documents),
        ("events", &raw.events),
    ] {
        for (name, body) in entries {
            let name = name.as_str().ok_or_else(|| {
                MongormError::Schema(format!("{section}: schema names must be strings"))
            })?;
            schemas.push(build_schema(section, name, body)?);
        }
    }

    Ok(SchemaFile {
        config: raw.settings,
        schemas,
    })
}

fn build_schema(section: &str, name: &str, body: &serde_yaml::Value) -> Result<SchemaDefinition> {
    let raw: RawSchema = if body.is_null() {
        RawSchema {
            collection: None,
            capped: None,
            fields: serde_yaml::Mapping::new(),
        }
    } else {
        serde_yaml::from_value(body.clone())
            .map_err(|e| MongormError::Schema(format!("{section}.{name}: {e}")))?
    };

    let mut schema = match section {
        "embedded" => SchemaDefinition::embedded(name),
        "events" => SchemaDefinition::event(name),
        _ => SchemaDefinition::document(name),
    };
    if let Some(collection) = &raw.collection {
        schema = schema.collection(collection);
    }
    if let Some(capped) = raw.capped {
        schema = schema.capped(capped);
    }

    for (field_name, entry) in &raw.fields {
        let field_name = field_name.as_str().ok_or_else(|| {
            MongormError::Schema(format!("{section}.{name}: field names must be strings"))
        })?;
        let context = format!("{name}.{field_name}");
        let entry: RawField = serde_yaml::from_value(entry.clone())
            .map_err(|e| MongormError::Schema(format!("{context}: {e}")))?;
        schema = schema.field(build_field(&context, field_name, &entry)?);
    }
    Ok(schema)
}

fn build_field(context: &str, name: &str, entry: &RawField) -> Result<FieldDescriptor> {
    let definition = match entry {
        RawField::Simple(type_name) => {
            return Ok(FieldDescriptor::new(name, simple_type(context, type_name)?));
        }
        RawField::Full(definition) => definition,
    };

    let (field_type, item_enum) = field_type(context, definition)?;
    let mut field = FieldDescriptor::new(name, field_type);
    if definition.required {
        field = field.required();
    }
    // An enum on a list applies to its elements, wherever it was declared.
    if let Some(values) = definition.enum_values.as_ref().or(item_enum.as_ref()) {
        field = field.one_of(values.iter().cloned());
    }
    match (&definition.auto, &definition.default) {
        (Some(_), Some(_)) => {
            return Err(MongormError::Schema(format!(
                "{context}: 'auto' and 'default' are mutually exclusive"
            )));
        }
        (Some(AutoValue::Now), None) => {
            if field.field_type != FieldType::Datetime {
                return Err(MongormError::Schema(format!(
                    "{context}: 'auto: now' requires a datetime field"
                )));
            }
            field = field.default_now();
        }
        (None, Some(default)) => {
            let json = serde_json::to_value(default)
                .map_err(|e| MongormError::Schema(format!("{context}: bad default: {e}")))?;
            field = field.default_value(Value::Json(json));
        }
        (None, None) => {}
    }
    Ok(field)
}

/// The declared type, plus the enum carried by a list's `items` entry.
fn field_type(
    context: &str,
    definition: &RawFieldDefinition,
) -> Result<(FieldType, Option<Vec<String>>)> {
    match definition.field_type.as_str() {
        "ref" => Ok((
            FieldType::Reference(match &definition.target {
                Some(RefTarget::Single(target)) => vec![target.clone()],
                Some(RefTarget::Multiple(targets)) => targets.clone(),
                None => Vec::new(),
            }),
            None,
        )),
        "list" => {
            let items = definition.items.as_ref().ok_or_else(|| {
                MongormError::Schema(format!("{context}: list fields need 'items'"))
            })?;
            let item_context = format!("{context}[]");
            if let RawField::Full(item) = items {
                if item.required || item.default.is_some() || item.auto.is_some() {
                    return Err(MongormError::Schema(format!(
                        "{item_context}: 'required', 'default' and 'auto' belong on the list field, not its items"
                    )));
                }
            }
            let item = build_field(&item_context, name_of(context), items)?;
            Ok((FieldType::list(item.field_type), item.enum_values))
        }
        other => {
            if definition.target.is_some() {
                return Err(MongormError::Schema(format!(
                    "{context}: 'target' only applies to ref fields"
                )));
            }
            Ok((simple_type(context, other)?, None))
        }
    }
}

fn name_of(context: &str) -> &str {
    context.rsplit('.').next().unwrap_or(context)
}

fn simple_type(context: &str, type_name: &str) -> Result<FieldType> {
    Ok(match type_name {
        "string" => FieldType::String,
        "integer" => FieldType::Integer,
        "float" | "number" => FieldType::Float,
        "boolean" => FieldType::Boolean,
        "datetime" => FieldType::Datetime,
        "object" => FieldType::Object,
        "any" => FieldType::Any,
        "ref" => FieldType::Reference(Vec::new()),
        "list" => {
            return Err(MongormError::Schema(format!(
                "{context}: list fields need 'items'"
            )))
        }
        other if other.trim().is_empty() => {
            return Err(MongormError::Schema(format!("{context}: empty type name")))
        }
        other => FieldType::Embedded(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReferencePolicy;
    use crate::schema::SchemaKind;
    use pretty_assertions::assert_eq;

    const SCHEMA: &str = r#"
settings:
  reference_policy: eager
  tail_poll_interval_ms: 25

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
      role: { type: string, enum: [admin, member], default: member }
      address: { type: Address }
      tags: { type: list, items: string }
      friends: { type: list, items: { type: ref, target: User } }
      joined: { type: datetime, auto: now }
  Post:
    fields:
      author: { type: ref, target: [User] }
      body: string

events:
  Signup:
    collection: user_events
    capped: { max_records: 50 }
    fields:
      plan: string
  Ping:
"#;

    #[test]
    fn test_parse_sections_in_order() {
        let file = parse_schemas_str(SCHEMA).unwrap();
        let names: Vec<&str> = file.schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Address", "User", "Post", "Signup", "Ping"]);
        assert_eq!(file.config.reference_policy, ReferencePolicy::Eager);
        assert_eq!(file.config.tail_poll_interval_ms, 25);
    }

    #[test]
    fn test_field_order_and_types() {
        let file = parse_schemas_str(SCHEMA).unwrap();
        let user = &file.schemas[1];
        assert_eq!(user.kind, SchemaKind::Document);
        assert_eq!(user.collection_name(), "users");

        let fields: Vec<(String, String)> = user
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type.to_string()))
            .collect();
        assert_eq!(
            fields,
            vec![
                ("name".to_string(), "string".to_string()),
                ("role".to_string(), "string".to_string()),
                ("address".to_string(), "Address".to_string()),
                ("tags".to_string(), "list<string>".to_string()),
                ("friends".to_string(), "list<ref<User>>".to_string()),
                ("joined".to_string(), "datetime".to_string()),
            ]
        );
        assert!(user.get_field("name").unwrap().required);
        assert_eq!(
            user.get_field("role").unwrap().enum_values,
            Some(vec!["admin".to_string(), "member".to_string()])
        );
        assert!(user.get_field("joined").unwrap().default.is_some());
    }

    #[test]
    fn test_events_get_base_fields() {
        let file = parse_schemas_str(SCHEMA).unwrap();
        let signup = &file.schemas[3];
        assert!(signup.is_event());
        assert_eq!(signup.collection_name(), "user_events");
        assert_eq!(signup.capped, Some(CappedOptions::records(50)));
        let names: Vec<&str> = signup.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["ref", "data", "created_at", "plan"]);

        let ping = &file.schemas[4];
        assert_eq!(ping.fields.len(), 3);
        assert_eq!(ping.capped, None);
    }

    #[test]
    fn test_empty_file() {
        let file = parse_schemas_str("").unwrap();
        assert!(file.schemas.is_empty());
        assert_eq!(file.config, StoreConfig::default());
    }

    #[test]
    fn test_list_without_items_rejected() {
        let result = parse_schemas_str("documents:\n  A:\n    fields:\n      xs: list\n");
        assert!(matches!(result, Err(MongormError::Schema(_))));
    }

    #[test]
    fn test_list_items_keep_their_enum() {
        use crate::document::{Document, FieldAccess};
        use crate::schema::SchemaRegistry;
        use crate::validation::IssueKind;
        use std::sync::Arc;

        let file = parse_schemas_str(
            "documents:\n  Paint:\n    fields:\n      tags: { type: list, items: { type: string, enum: [red, blue] } }\n",
        )
        .unwrap();
        assert_eq!(
            file.schemas[0].get_field("tags").unwrap().enum_values,
            Some(vec!["red".to_string(), "blue".to_string()])
        );

        let registry = SchemaRegistry::new();
        let paint: Arc<SchemaDefinition> = registry.register(file.schemas[0].clone()).unwrap();
        assert!(Document::new(paint.clone())
            .with("tags", vec!["red", "blue"])
            .validate(&registry)
            .is_ok());

        let err = Document::new(paint)
            .with("tags", vec!["red", "green"])
            .validate(&registry)
            .unwrap_err();
        let MongormError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert!(matches!(errors.kind_at("tags[1]"), Some(IssueKind::NotInEnum { .. })));
    }

    #[test]
    fn test_required_or_default_on_items_rejected() {
        for items in ["{ type: string, required: true }", "{ type: string, default: x }"] {
            let yaml = format!("documents:\n  A:\n    fields:\n      xs: {{ type: list, items: {items} }}\n");
            assert!(matches!(parse_schemas_str(&yaml), Err(MongormError::Schema(_))));
        }
    }

    #[test]
    fn test_auto_now_requires_datetime() {
        let result = parse_schemas_str(
            "documents:\n  A:\n    fields:\n      x: { type: string, auto: now }\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = parse_schemas_str("documents:\n  A:\n    path: nope\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("schema.yaml");
        std::fs::write(&path, SCHEMA).unwrap();
        let file = parse_schema_file(&path).unwrap();
        assert_eq!(file.schemas.len(), 5);
    }
}
