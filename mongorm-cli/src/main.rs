use clap::{Parser, Subcommand, ValueEnum};
use mongorm::{Document, FieldAccess, Filter, ObjectId, Store, SubscriberOptions, Value};
use std::process;
use std::sync::mpsc;

/// mongorm CLI: inspect and modify a mongorm data directory
#[derive(Parser)]
#[command(name = "mongorm", version, about)]
struct Cli {
    /// Path to the data directory holding schema.yaml and _system.db
    #[arg(long, env = "MONGORM_DATA_DIR", default_value = ".")]
    data_dir: String,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List declared schemas and their fields
    Schemas,

    /// Get a single document by ID
    Get {
        /// Schema name
        schema: String,
        /// Document ID
        id: String,
    },

    /// Find documents by field equality
    Find {
        /// Schema name
        schema: String,
        /// Equality conditions (e.g. --where address.city=Oslo)
        #[arg(long = "where", value_parser = parse_key_value)]
        conditions: Vec<(String, String)>,
    },

    /// Validate and insert a new document
    Insert {
        /// Schema name
        schema: String,
        /// Field values (e.g. --field name="Alice Chen")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a document
    Delete {
        /// Schema name
        schema: String,
        /// Document ID
        id: String,
    },

    /// Append an event to its capped collection
    Fire {
        /// Event schema name
        schema: String,
        /// Field values (e.g. --field data='{"k":1}')
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Print events as they are fired
    Tail {
        /// Event schema name
        schema: String,
        /// Replay the events still held by the collection first
        #[arg(long)]
        from_beginning: bool,
        /// Exit after this many events
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&cli.data_dir)?;

    match cli.command {
        Command::Schemas => {
            let mut schemas = Vec::new();
            for name in store.registry().names() {
                let schema = store.registry().lookup(&name)?;
                let fields: serde_json::Map<String, serde_json::Value> = schema
                    .fields
                    .iter()
                    .map(|f| {
                        (
                            f.name.clone(),
                            serde_json::json!({
                                "type": f.field_type.to_string(),
                                "required": f.required,
                            }),
                        )
                    })
                    .collect();
                let mut entry = serde_json::json!({
                    "name": schema.name,
                    "kind": format!("{:?}", schema.kind).to_lowercase(),
                    "fields": fields,
                });
                if schema.is_persistent() {
                    entry["collection"] = schema.collection_name().into();
                }
                if schema.is_event() {
                    entry["capped"] = serde_json::to_value(store.capped_options(&schema))?;
                }
                schemas.push(entry);
            }
            print_output(&serde_json::Value::Array(schemas), &cli.format)?;
        }

        Command::Get { schema, id } => {
            let doc = store.get(&schema, &ObjectId::parse(&id)?)?;
            print_output(&document_json(&doc), &cli.format)?;
        }

        Command::Find { schema, conditions } => {
            let filter = Filter::from_json(&fields_to_value(&conditions))?;
            let docs = store
                .find(&schema, filter)?
                .map(|doc| doc.map(|d| document_json(&d)))
                .collect::<mongorm::Result<Vec<_>>>()?;
            print_output(&serde_json::Value::Array(docs), &cli.format)?;
        }

        Command::Insert { schema, fields } => {
            let mut doc = store.document_from_json(&schema, &fields_to_value(&fields))?;
            doc.save(&store)?;
            print_output(&document_json(&doc), &cli.format)?;
        }

        Command::Delete { schema, id } => {
            let mut doc = store.get(&schema, &ObjectId::parse(&id)?)?;
            doc.delete(&store)?;
            print_output(&serde_json::json!({ "ok": true, "deleted": id }), &cli.format)?;
        }

        Command::Fire { schema, fields } => {
            let values = fields
                .iter()
                .map(|(k, v)| (k.as_str(), Value::Json(parse_field_value(v))))
                .collect();
            let event = store.fire(&schema, values)?;
            print_output(&document_json(&event), &cli.format)?;
        }

        Command::Tail {
            schema,
            from_beginning,
            limit,
        } => {
            let definition = store.event_schema(&schema)?;
            store.ensure_capped(&schema)?;
            let options = if from_beginning {
                SubscriberOptions::from_beginning()
            } else {
                SubscriberOptions::new()
            };

            let (tx, rx) = mpsc::channel();
            let wanted = schema.clone();
            let mut subscriber =
                store.subscriber_with(definition.collection_name(), options, move |doc| {
                    // Other event schemas may share the collection.
                    if is_schema(&doc, &wanted) {
                        tx.send(document_json(&doc))?;
                    }
                    Ok(())
                });
            subscriber.start()?;
            log::info!("Tailing {schema} in '{}'", definition.collection_name());

            let mut seen = 0;
            while limit.map_or(true, |limit| seen < limit) {
                let event = rx.recv()?;
                match cli.format {
                    OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
                    OutputFormat::Yaml => print!("---\n{}", serde_yaml::to_string(&event)?),
                }
                seen += 1;
            }
            subscriber.stop()?;
        }
    }

    Ok(())
}

fn is_schema(doc: &Document, name: &str) -> bool {
    doc.schema().name == name
}

fn document_json(doc: &Document) -> serde_json::Value {
    serde_json::Value::Object(doc.to_record())
}

fn print_output(value: &serde_json::Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

/// Field values are parsed as JSON when possible (numbers, booleans, arrays,
/// objects) and taken as plain strings otherwise.
fn parse_field_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn fields_to_value(fields: &[(String, String)]) -> serde_json::Value {
    let map = fields
        .iter()
        .map(|(key, val)| (key.clone(), parse_field_value(val)))
        .collect();
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("name=Alice=Chen").unwrap(),
            ("name".to_string(), "Alice=Chen".to_string())
        );
        assert!(parse_key_value("name").is_err());
    }

    #[test]
    fn test_tail_filters_by_schema() {
        let registry = mongorm::SchemaRegistry::new();
        registry
            .register_all(
                mongorm::schema::parse_schemas_str(
                    "events:\n  Signup:\n    collection: user_events\n  Login:\n    collection: user_events\n",
                )
                .unwrap()
                .schemas,
            )
            .unwrap();
        let store = Store::in_memory(std::sync::Arc::new(registry));
        let signup = store.fire("Signup", vec![]).unwrap();
        let login = store.fire("Login", vec![]).unwrap();
        assert!(is_schema(&signup, "Signup"));
        assert!(!is_schema(&login, "Signup"));
    }

    #[test]
    fn test_fields_to_value() {
        let fields = vec![
            ("age".to_string(), "31".to_string()),
            ("name".to_string(), "Alice".to_string()),
            ("tags".to_string(), r#"["a","b"]"#.to_string()),
        ];
        assert_eq!(
            fields_to_value(&fields),
            serde_json::json!({ "age": 31, "name": "Alice", "tags": ["a", "b"] })
        );
    }
}
