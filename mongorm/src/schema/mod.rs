mod parser;
mod registry;
mod types;

pub use parser::{parse_schema_file, parse_schemas_str, SchemaFile};
pub use registry::SchemaRegistry;
pub use types::*;
