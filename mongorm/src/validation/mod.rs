use crate::document::{
    parse_datetime, Document, EmbeddedDocument, FieldAccess, Reference, Value, REF_COLLECTION_KEY,
    REF_ID_KEY,
};
use crate::error::Result;
use crate::schema::{FieldDescriptor, FieldType, SchemaDefinition, SchemaRegistry};
use crate::storage::{ObjectId, ID_KEY, TYPE_KEY};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// What is wrong with a single field value
#[derive(Debug, Clone, PartialEq)]
pub enum IssueKind {
    MissingRequiredField,
    TypeMismatch { expected: String, found: String },
    NotInEnum { value: String, allowed: Vec<String> },
    /// A value was set on a field the schema does not declare
    UnknownField,
    /// A reference points at a document that has no identifier yet
    UnsavedReference,
    WrongReferenceTarget { expected: Vec<String>, found: String },
    UnknownSchema(String),
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::MissingRequiredField => write!(f, "missing required field"),
            IssueKind::TypeMismatch { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            IssueKind::NotInEnum { value, allowed } => {
                write!(f, "'{value}' is not one of {allowed:?}")
            }
            IssueKind::UnknownField => write!(f, "field is not declared"),
            IssueKind::UnsavedReference => write!(f, "referenced document has not been saved"),
            IssueKind::WrongReferenceTarget { expected, found } => {
                write!(f, "reference to '{found}', expected one of {expected:?}")
            }
            IssueKind::UnknownSchema(name) => write!(f, "unknown schema '{name}'"),
        }
    }
}

/// A field contract violation. `path` uses `address.street` / `tags[2]` notation.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldIssue {
    pub path: String,
    pub kind: IssueKind,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.kind)
    }
}

/// Every field problem found while validating one document.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Validation failed for '{schema}': {}", join_issues(.issues))]
pub struct ValidationErrors {
    pub schema: String,
    pub issues: Vec<FieldIssue>,
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    /// The issue reported for `path`, if any.
    pub fn kind_at(&self, path: &str) -> Option<&IssueKind> {
        self.issues.iter().find(|i| i.path == path).map(|i| &i.kind)
    }

    pub fn paths(&self) -> Vec<&str> {
        self.issues.iter().map(|i| i.path.as_str()).collect()
    }
}

impl FieldDescriptor {
    /// Validate and coerce a raw value against this declaration.
    ///
    /// `None` (or null) means the field is unset: the default is produced if
    /// there is one, list fields become empty, and required fields fail.
    /// `Ok(None)` is an optional field left absent.
    pub fn validate(
        &self,
        raw: Option<&Value>,
        registry: &SchemaRegistry,
    ) -> std::result::Result<Option<Value>, Vec<FieldIssue>> {
        let mut checker = Checker::new(registry);
        let value = checker.field(&self.name, self, raw);
        if checker.issues.is_empty() {
            Ok(value)
        } else {
            Err(checker.issues)
        }
    }
}

/// Validate all fields of a schema instance, aggregating every issue.
/// Returns the coerced values of the fields that are present.
pub fn validate_fields(
    schema: &SchemaDefinition,
    fields: &BTreeMap<String, Value>,
    registry: &SchemaRegistry,
) -> std::result::Result<BTreeMap<String, Value>, ValidationErrors> {
    let mut checker = Checker::new(registry);
    let validated = checker.fields("", schema, fields);
    if checker.issues.is_empty() {
        Ok(validated)
    } else {
        Err(ValidationErrors {
            schema: schema.name.clone(),
            issues: checker.issues,
        })
    }
}

impl Document {
    /// Check the current field values without persisting anything.
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<()> {
        validate_fields(self.schema(), self.fields(), registry)?;
        Ok(())
    }
}

impl EmbeddedDocument {
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<()> {
        validate_fields(self.schema(), self.fields(), registry)?;
        Ok(())
    }
}

struct Checker<'a> {
    registry: &'a SchemaRegistry,
    issues: Vec<FieldIssue>,
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl<'a> Checker<'a> {
    fn new(registry: &'a SchemaRegistry) -> Self {
        Checker {
            registry,
            issues: Vec::new(),
        }
    }

    fn issue(&mut self, path: &str, kind: IssueKind) {
        self.issues.push(FieldIssue {
            path: path.to_string(),
            kind,
        });
    }

    fn mismatch(&mut self, path: &str, expected: &FieldType, found: &Value) {
        self.issue(
            path,
            IssueKind::TypeMismatch {
                expected: expected.to_string(),
                found: found.type_name().to_string(),
            },
        );
    }

    fn fields(
        &mut self,
        prefix: &str,
        schema: &SchemaDefinition,
        fields: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let mut validated = BTreeMap::new();
        for descriptor in &schema.fields {
            let path = join_path(prefix, &descriptor.name);
            if let Some(value) = self.field(&path, descriptor, fields.get(&descriptor.name)) {
                validated.insert(descriptor.name.clone(), value);
            }
        }
        for (name, value) in fields {
            if schema.get_field(name).is_none() && !value.is_null() {
                self.issue(&join_path(prefix, name), IssueKind::UnknownField);
            }
        }
        validated
    }

    fn field(&mut self, path: &str, descriptor: &FieldDescriptor, raw: Option<&Value>) -> Option<Value> {
        let enum_values = descriptor.enum_values.as_deref();
        match raw.filter(|v| !v.is_null()) {
            Some(value) => self.value(path, &descriptor.field_type, enum_values, value),
            None => match &descriptor.default {
                Some(default) => {
                    let produced = default.produce();
                    if produced.is_null() {
                        self.absent(path, descriptor)
                    } else {
                        self.value(path, &descriptor.field_type, enum_values, &produced)
                    }
                }
                None => self.absent(path, descriptor),
            },
        }
    }

    fn absent(&mut self, path: &str, descriptor: &FieldDescriptor) -> Option<Value> {
        if matches!(descriptor.field_type, FieldType::List(_)) {
            return Some(Value::List(Vec::new()));
        }
        if descriptor.required {
            self.issue(path, IssueKind::MissingRequiredField);
        }
        None
    }

    fn value(
        &mut self,
        path: &str,
        field_type: &FieldType,
        enum_values: Option<&[String]>,
        raw: &Value,
    ) -> Option<Value> {
        use serde_json::Value as Json;

        let coerced = match (field_type, raw) {
            (FieldType::String, Value::String(s)) | (FieldType::String, Value::Json(Json::String(s))) => {
                Some(Value::String(s.clone()))
            }
            (FieldType::Integer, Value::Integer(n)) => Some(Value::Integer(*n)),
            (FieldType::Integer, Value::Json(Json::Number(n))) => n.as_i64().map(Value::Integer),
            (FieldType::Float, Value::Float(n)) if n.is_finite() => Some(Value::Float(*n)),
            (FieldType::Float, Value::Integer(n)) => Some(Value::Float(*n as f64)),
            (FieldType::Float, Value::Json(Json::Number(n))) => n.as_f64().map(Value::Float),
            (FieldType::Boolean, Value::Boolean(b)) | (FieldType::Boolean, Value::Json(Json::Bool(b))) => {
                Some(Value::Boolean(*b))
            }
            (FieldType::Datetime, Value::Datetime(dt)) => Some(Value::Datetime(*dt)),
            (FieldType::Datetime, Value::String(s)) | (FieldType::Datetime, Value::Json(Json::String(s))) => {
                parse_datetime(s).map(Value::Datetime)
            }
            (FieldType::Object, Value::Json(Json::Object(map))) => {
                Some(Value::Json(Json::Object(map.clone())))
            }
            (FieldType::Any, other) => Some(Value::Json(other.to_json())),
            (FieldType::Embedded(name), _) => return self.embedded(path, name, raw),
            (FieldType::Reference(targets), _) => return self.reference(path, targets, raw),
            (FieldType::List(items), Value::List(values)) => {
                return Some(self.list(path, items, enum_values, values.iter()))
            }
            (FieldType::List(items), Value::Json(Json::Array(values))) => {
                let values: Vec<Value> = values.iter().cloned().map(Value::Json).collect();
                return Some(self.list(path, items, enum_values, values.iter()));
            }
            _ => None,
        };

        let Some(coerced) = coerced else {
            self.mismatch(path, field_type, raw);
            return None;
        };
        if let (Some(allowed), Value::String(s)) = (enum_values, &coerced) {
            if !allowed.iter().any(|a| a == s) {
                self.issue(
                    path,
                    IssueKind::NotInEnum {
                        value: s.clone(),
                        allowed: allowed.to_vec(),
                    },
                );
                return None;
            }
        }
        Some(coerced)
    }

    fn list<'v>(
        &mut self,
        path: &str,
        items: &FieldType,
        enum_values: Option<&[String]>,
        values: impl Iterator<Item = &'v Value>,
    ) -> Value {
        let mut out = Vec::new();
        for (index, item) in values.enumerate() {
            let item_path = format!("{path}[{index}]");
            if item.is_null() {
                self.mismatch(&item_path, items, item);
                continue;
            }
            if let Some(value) = self.value(&item_path, items, enum_values, item) {
                out.push(value);
            }
        }
        Value::List(out)
    }

    fn embedded(&mut self, path: &str, declared: &str, raw: &Value) -> Option<Value> {
        let (schema, fields) = match raw {
            Value::Embedded(doc) => (doc.schema_arc().clone(), doc.fields().clone()),
            Value::Json(serde_json::Value::Object(map)) => {
                let name = map
                    .get(TYPE_KEY)
                    .and_then(|v| v.as_str())
                    .unwrap_or(declared);
                let schema = match self.registry.get(name) {
                    Some(schema) => schema,
                    None => {
                        self.issue(path, IssueKind::UnknownSchema(name.to_string()));
                        return None;
                    }
                };
                let fields: BTreeMap<String, Value> = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != TYPE_KEY && k.as_str() != ID_KEY)
                    .map(|(k, v)| (k.clone(), Value::Json(v.clone())))
                    .collect();
                (schema, fields)
            }
            other => {
                self.mismatch(path, &FieldType::embedded(declared), other);
                return None;
            }
        };

        if schema.name != declared {
            self.issue(
                path,
                IssueKind::TypeMismatch {
                    expected: declared.to_string(),
                    found: schema.name.clone(),
                },
            );
            return None;
        }

        let before = self.issues.len();
        let validated = self.fields(path, &schema, &fields);
        if self.issues.len() > before {
            return None;
        }
        Some(Value::Embedded(EmbeddedDocument::from_parts(schema, validated)))
    }

    fn reference(&mut self, path: &str, targets: &[String], raw: &Value) -> Option<Value> {
        use serde_json::Value as Json;

        let reference = match raw {
            Value::Reference(r) => r.clone(),
            Value::String(id) | Value::Json(Json::String(id)) => {
                let [target] = targets else {
                    self.mismatch(path, &FieldType::Reference(targets.to_vec()), raw);
                    return None;
                };
                let schema = self.target_schema(path, target)?;
                let Ok(id) = ObjectId::parse(id) else {
                    self.mismatch(path, &FieldType::Reference(targets.to_vec()), raw);
                    return None;
                };
                Reference::new(schema.collection_name(), id).with_schema(Some(schema.name.clone()))
            }
            Value::Json(Json::Object(map)) => {
                let collection = map.get(REF_COLLECTION_KEY).and_then(Json::as_str);
                let id = map
                    .get(REF_ID_KEY)
                    .and_then(Json::as_str)
                    .and_then(|id| ObjectId::parse(id).ok());
                match (collection, id) {
                    (Some(collection), Some(id)) => Reference::new(collection, id),
                    _ => {
                        self.mismatch(path, &FieldType::Reference(targets.to_vec()), raw);
                        return None;
                    }
                }
            }
            other => {
                self.mismatch(path, &FieldType::Reference(targets.to_vec()), other);
                return None;
            }
        };

        if reference.id().is_none() {
            self.issue(path, IssueKind::UnsavedReference);
            return None;
        }
        if targets.is_empty() {
            return Some(Value::Reference(reference));
        }

        match reference.schema() {
            Some(schema) => {
                if !targets.iter().any(|t| t == schema) {
                    self.issue(
                        path,
                        IssueKind::WrongReferenceTarget {
                            expected: targets.to_vec(),
                            found: schema.to_string(),
                        },
                    );
                    return None;
                }
                Some(Value::Reference(reference))
            }
            None => {
                // Only the collection is known: accept it if a target lives there.
                let mut matched: Option<Arc<SchemaDefinition>> = None;
                for target in targets {
                    let schema = self.target_schema(path, target)?;
                    if schema.collection_name() == reference.collection() {
                        matched = Some(schema);
                        break;
                    }
                }
                match matched {
                    Some(schema) => {
                        let single = (targets.len() == 1).then(|| schema.name.clone());
                        Some(Value::Reference(reference.with_schema(single)))
                    }
                    None => {
                        self.issue(
                            path,
                            IssueKind::WrongReferenceTarget {
                                expected: targets.to_vec(),
                                found: reference.collection().to_string(),
                            },
                        );
                        None
                    }
                }
            }
        }
    }

    fn target_schema(&mut self, path: &str, target: &str) -> Option<Arc<SchemaDefinition>> {
        match self.registry.get(target) {
            Some(schema) => Some(schema),
            None => {
                self.issue(path, IssueKind::UnknownSchema(target.to_string()));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schemas_str;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let file = parse_schemas_str(
            r#"
embedded:
  Address:
    fields:
      street: { type: string, required: true }
      zip: integer
documents:
  User:
    collection: users
    fields:
      name: { type: string, required: true }
      age: integer
      score: float
      role: { type: string, enum: [admin, member], default: member }
      address: Address
      tags: { type: list, items: string }
      born: datetime
      meta: object
  Post:
    collection: posts
    fields:
      author: { type: ref, target: User }
      title: { type: string, required: true }
"#,
        )
        .unwrap();
        let registry = SchemaRegistry::new();
        registry.register_all(file.schemas).unwrap();
        registry
    }

    fn user(registry: &SchemaRegistry) -> Document {
        Document::new(registry.lookup("User").unwrap())
    }

    #[test]
    fn test_valid_document() {
        let registry = registry();
        let doc = user(&registry).with("name", "Alice").with("age", 30);
        assert!(doc.validate(&registry).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let registry = registry();
        let errors = validate_fields(&registry.lookup("User").unwrap(), &BTreeMap::new(), &registry)
            .unwrap_err();
        assert_eq!(errors.kind_at("name"), Some(&IssueKind::MissingRequiredField));
    }

    #[test]
    fn test_all_issues_are_aggregated() {
        let registry = registry();
        let doc = user(&registry)
            .with("age", "thirty")
            .with("role", "owner")
            .with("nickname", "Al");
        let errors = validate_fields(doc.schema(), doc.fields(), &registry).unwrap_err();
        assert_eq!(errors.paths(), vec!["name", "age", "role", "nickname"]);
        assert_eq!(
            errors.kind_at("age"),
            Some(&IssueKind::TypeMismatch {
                expected: "integer".into(),
                found: "string".into()
            })
        );
        assert!(matches!(errors.kind_at("role"), Some(IssueKind::NotInEnum { .. })));
        assert_eq!(errors.kind_at("nickname"), Some(&IssueKind::UnknownField));
    }

    #[test]
    fn test_defaults_and_empty_lists() {
        let registry = registry();
        let doc = user(&registry).with("name", "Alice");
        let validated = validate_fields(doc.schema(), doc.fields(), &registry).unwrap();
        assert_eq!(validated["role"], Value::String("member".into()));
        assert_eq!(validated["tags"], Value::List(vec![]));
        assert!(!validated.contains_key("age"));
    }

    #[test]
    fn test_json_input_is_coerced() {
        let registry = registry();
        let doc = user(&registry)
            .with("name", json!("Alice"))
            .with("age", json!(30))
            .with("score", json!(3))
            .with("born", "2024-01-02T03:04:05Z")
            .with("tags", json!(["a", "b"]))
            .with("address", json!({ "street": "Main", "zip": 12345 }));
        let validated = validate_fields(doc.schema(), doc.fields(), &registry).unwrap();
        assert_eq!(validated["age"], Value::Integer(30));
        assert_eq!(validated["score"], Value::Float(3.0));
        assert!(matches!(validated["born"], Value::Datetime(_)));
        assert_eq!(
            validated["tags"],
            Value::List(vec![Value::String("a".into()), Value::String("b".into())])
        );
        let address = validated["address"].as_embedded().unwrap();
        assert_eq!(address.get_i64("zip"), Some(12345));
    }

    #[test]
    fn test_nested_paths() {
        let registry = registry();
        let doc = user(&registry)
            .with("name", "Alice")
            .with("tags", json!(["ok", 5]))
            .with("address", json!({ "zip": "nope" }));
        let errors = validate_fields(doc.schema(), doc.fields(), &registry).unwrap_err();
        assert_eq!(errors.paths(), vec!["address.street", "address.zip", "tags[1]"]);
    }

    #[test]
    fn test_producer_default_is_fresh() {
        let registry = SchemaRegistry::new();
        let schema = registry
            .register(
                SchemaDefinition::document("Stamp").field(
                    FieldDescriptor::new("at", FieldType::Datetime)
                        .required()
                        .default_now(),
                ),
            )
            .unwrap();
        let first = validate_fields(&schema, &BTreeMap::new(), &registry).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = validate_fields(&schema, &BTreeMap::new(), &registry).unwrap();
        let a = *first["at"].as_datetime().unwrap();
        let b = *second["at"].as_datetime().unwrap();
        assert!(a < b);
        assert!(b <= Utc::now());
    }

    #[test]
    fn test_reference_rules() {
        let registry = registry();
        let author = user(&registry).with("name", "Alice");
        let field = registry.lookup("Post").unwrap().get_field("author").unwrap().clone();

        let errors = field
            .validate(Some(&Value::from(&author)), &registry)
            .unwrap_err();
        assert_eq!(errors[0].kind, IssueKind::UnsavedReference);

        let id = ObjectId::generate();
        let by_id = field
            .validate(Some(&Value::String(id.to_string())), &registry)
            .unwrap()
            .unwrap();
        let reference = by_id.as_reference().unwrap();
        assert_eq!(reference.collection(), "users");
        assert_eq!(reference.id(), Some(&id));
        assert_eq!(reference.schema(), Some("User"));

        let wrong = field
            .validate(Some(&Value::Reference(Reference::new("posts", id))), &registry)
            .unwrap_err();
        assert!(matches!(wrong[0].kind, IssueKind::WrongReferenceTarget { .. }));
    }

    #[test]
    fn test_unknown_embedded_schema() {
        let registry = SchemaRegistry::new();
        let schema = registry
            .register(
                SchemaDefinition::document("Thing")
                    .field(FieldDescriptor::new("part", FieldType::embedded("Missing"))),
            )
            .unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("part".to_string(), Value::Json(json!({})));
        let errors = validate_fields(&schema, &fields, &registry).unwrap_err();
        assert_eq!(
            errors.kind_at("part"),
            Some(&IssueKind::UnknownSchema("Missing".into()))
        );
    }

    #[test]
    fn test_error_message_lists_every_issue() {
        let registry = registry();
        let doc = user(&registry).with("age", "x");
        let err = crate::error::MongormError::from(
            validate_fields(doc.schema(), doc.fields(), &registry).unwrap_err(),
        );
        let message = err.to_string();
        assert!(message.contains("name: missing required field"), "{message}");
        assert!(message.contains("age: expected integer, found string"), "{message}");
    }
}
