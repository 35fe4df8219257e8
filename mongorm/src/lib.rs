pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod schema;
pub mod storage;
pub mod store;
pub mod subscriber;
pub mod validation;

pub use config::{ReferencePolicy, StoreConfig};
pub use document::{Document, EmbeddedDocument, FieldAccess, Reference, Value};
pub use error::{DecodeError, MongormError, Result};
pub use schema::{FieldDescriptor, FieldType, SchemaDefinition, SchemaKind, SchemaRegistry};
pub use storage::{CappedOptions, Filter, ObjectId, Position, Storage};
pub use store::{Cursor, Store};
pub use subscriber::{HandlerResult, Subscriber, SubscriberOptions, SubscriberState};
pub use validation::{FieldIssue, IssueKind, ValidationErrors};
