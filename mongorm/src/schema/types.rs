use crate::document::Value;
use crate::storage::CappedOptions;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;

/// Names of the fields every event schema carries.
pub const EVENT_REF_FIELD: &str = "ref";
pub const EVENT_DATA_FIELD: &str = "data";
pub const EVENT_CREATED_AT_FIELD: &str = "created_at";

/// Declared type of a field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Datetime,
    /// Free-form mapping
    Object,
    /// Any encodable value, stored as-is
    Any,
    /// Inline document of the named embedded schema
    Embedded(String),
    /// Reference to a document of one of the named schemas (any document when empty)
    Reference(Vec<String>),
    List(Box<FieldType>),
}

impl FieldType {
    pub fn list(items: FieldType) -> Self {
        FieldType::List(Box::new(items))
    }

    pub fn reference(target: &str) -> Self {
        FieldType::Reference(vec![target.to_string()])
    }

    pub fn embedded(schema: &str) -> Self {
        FieldType::Embedded(schema.to_string())
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Float => write!(f, "float"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Datetime => write!(f, "datetime"),
            FieldType::Object => write!(f, "object"),
            FieldType::Any => write!(f, "any"),
            FieldType::Embedded(name) => write!(f, "{name}"),
            FieldType::Reference(targets) if targets.is_empty() => write!(f, "ref"),
            FieldType::Reference(targets) => write!(f, "ref<{}>", targets.join("|")),
            FieldType::List(items) => write!(f, "list<{items}>"),
        }
    }
}

/// Value a field takes when it is left unset.
#[derive(Clone)]
pub enum DefaultValue {
    /// Copied into every new document
    Static(Value),
    /// Called once per validation
    Producer(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DefaultValue {
    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Static(value) => value.clone(),
            DefaultValue::Producer(producer) => producer(),
        }
    }

    /// Producer yielding the current UTC timestamp.
    pub fn now() -> Self {
        DefaultValue::Producer(Arc::new(|| Value::Datetime(Utc::now())))
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Static(value) => f.debug_tuple("Static").field(value).finish(),
            DefaultValue::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

/// Declaration of a single named field on a schema
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<DefaultValue>,
    pub enum_values: Option<Vec<String>>,
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        FieldDescriptor {
            name: name.to_string(),
            field_type,
            required: false,
            default: None,
            enum_values: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Static(value.into()));
        self
    }

    pub fn default_with<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Producer(Arc::new(producer)));
        self
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(DefaultValue::now());
        self
    }

    /// Restrict a string field to a fixed set of values.
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// Top-level, persisted in its own collection
    Document,
    /// Stored inline inside other documents
    Embedded,
    /// Document persisted in a capped collection
    Event,
}

/// Ordered field declarations for one schema
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    pub name: String,
    pub kind: SchemaKind,
    pub collection: Option<String>,
    pub capped: Option<CappedOptions>,
    pub fields: Vec<FieldDescriptor>,
}

impl SchemaDefinition {
    pub fn document(name: &str) -> Self {
        Self::with_kind(name, SchemaKind::Document)
    }

    pub fn embedded(name: &str) -> Self {
        Self::with_kind(name, SchemaKind::Embedded)
    }

    /// An event schema. Carries the `ref`, `data` and `created_at` fields.
    pub fn event(name: &str) -> Self {
        Self::with_kind(name, SchemaKind::Event)
            .field(FieldDescriptor::new(
                EVENT_REF_FIELD,
                FieldType::Reference(Vec::new()),
            ))
            .field(FieldDescriptor::new(EVENT_DATA_FIELD, FieldType::Any))
            .field(
                FieldDescriptor::new(EVENT_CREATED_AT_FIELD, FieldType::Datetime)
                    .required()
                    .default_now(),
            )
    }

    fn with_kind(name: &str, kind: SchemaKind) -> Self {
        SchemaDefinition {
            name: name.to_string(),
            kind,
            collection: None,
            capped: None,
            fields: Vec::new(),
        }
    }

    pub fn collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.to_string());
        self
    }

    pub fn capped(mut self, options: CappedOptions) -> Self {
        self.capped = Some(options);
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Collection backing this schema; defaults to the schema name.
    pub fn collection_name(&self) -> &str {
        self.collection.as_deref().unwrap_or(&self.name)
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_persistent(&self) -> bool {
        self.kind != SchemaKind::Embedded
    }

    pub fn is_event(&self) -> bool {
        self.kind == SchemaKind::Event
    }

    /// Schemas this one stores inline, directly or through lists.
    pub fn embedded_dependencies(&self) -> Vec<&str> {
        fn collect<'a>(field_type: &'a FieldType, out: &mut Vec<&'a str>) {
            match field_type {
                FieldType::Embedded(name) => out.push(name),
                FieldType::List(items) => collect(items, out),
                _ => {}
            }
        }
        let mut out = Vec::new();
        for field in &self.fields {
            collect(&field.field_type, &mut out);
        }
        out
    }
}
