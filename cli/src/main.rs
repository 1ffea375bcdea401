use std::path::PathBuf;
use std::process::ExitCode;

use atomkv::{AtomRegistry, Namespace, NamespacedStore, Snapshot, DELIMITER};
use atomkv_cli::{SqliteBackend, SqliteStore};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{debug, error};

/// Inspect and edit an atomkv SQLite store
#[derive(Parser, Debug)]
#[command(name = "atomkv", version, about)]
struct Args {
    /// Path to the SQLite database
    #[arg(long, default_value = "atomkv.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the value and status of a key
    Get {
        key: String,
        /// Value to report when the key is not stored (JSON)
        #[arg(long, default_value = "null")]
        default: String,
    },
    /// Store a value (JSON, or a plain string)
    Set { key: String, value: String },
    /// Remove a key
    Rm { key: String },
    /// Print the fields of a namespace instance as one document
    NsGet {
        prefix: String,
        /// Instance identifier; omit for a global namespace
        #[arg(long)]
        id: Option<String>,
        /// Fields to load; defaults to every stored field
        fields: Vec<String>,
    },
    /// Store one field of a namespace instance
    NsSet {
        prefix: String,
        #[arg(long)]
        id: Option<String>,
        field: String,
        value: String,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json(value: &impl serde::Serialize) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn namespace_store(
    registry: &AtomRegistry<SqliteBackend>,
    prefix: &str,
    id: Option<&str>,
) -> CliResult<NamespacedStore<SqliteBackend>> {
    let namespace = Namespace::new(prefix);
    let bound = match id {
        Some(id) => namespace.bind(Some(id))?,
        None => namespace.global()?,
    };
    Ok(NamespacedStore::new(registry, bound))
}

async fn run(args: Args) -> CliResult<()> {
    let store = SqliteStore::open(&args.db)?;
    let registry = AtomRegistry::new(store.connect());
    debug!("cli: {:?} on {}", args.command, args.db.display());

    match args.command {
        Command::Get { key, default } => {
            let atom = registry.get_or_create(key, parse_value(&default));
            atom.ready().await?;
            print_json(&atom.snapshot())?;
        }
        Command::Set { key, value } => {
            let value = parse_value(&value);
            registry.set(key.as_str(), value.clone()).await?;
            print_json(&json!({ "key": key, "value": value }))?;
        }
        Command::Rm { key } => {
            registry.remove(key.as_str()).await?;
            print_json(&json!({ "key": key, "removed": true }))?;
        }
        Command::NsGet { prefix, id, fields } => {
            let ns = namespace_store(&registry, &prefix, id.as_deref())?;
            let fields = if fields.is_empty() {
                let prefix = format!("{}{DELIMITER}", ns.namespace().key());
                store
                    .keys_with_prefix(&prefix)?
                    .iter()
                    .filter_map(|key| ns.namespace().field_of(key).map(str::to_string))
                    .collect()
            } else {
                fields
            };
            let document = ns
                .load_document(fields.into_iter().map(|field| (field, Value::Null)))
                .await?;
            print_json(&document)?;
        }
        Command::NsSet {
            prefix,
            id,
            field,
            value,
        } => {
            let ns = namespace_store(&registry, &prefix, id.as_deref())?;
            ns.set(&field, parse_value(&value)).await?;
            let atom = ns.get(&field, Value::Null)?;
            let Snapshot { value, status } = atom.snapshot();
            print_json(&json!({ "key": atom.key(), "value": value, "status": status }))?;
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("atomkv: {err}");
            ExitCode::FAILURE
        }
    }
}
