//! mapstore node CLI
//!
//! Opens a `String -> JSON` cache over the selected backing store, runs one
//! command, and flushes pending writes before exiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mapstore_core::FieldEquals;
use mapstore_node::storage::backends::InMemoryStore;
#[cfg(feature = "postgres")]
use mapstore_node::storage::backends::PostgresStore;
#[cfg(feature = "redb")]
use mapstore_node::storage::backends::RedbStore;
use mapstore_node::{BackingStore, CacheConfig, InitialLoadMode, MapCache, MapCacheFactory};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
    Redb,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "mapstore-node", about = "Write-behind cache node")]
struct Args {
    /// Backing store
    #[arg(long, env = "MAPSTORE_BACKEND", value_enum, default_value = "redb")]
    backend: Backend,

    /// Database file for the redb backend
    #[arg(long, env = "MAPSTORE_REDB_PATH", default_value = "./mapstore.redb")]
    redb_path: PathBuf,

    /// Connection URL for the postgres backend
    #[arg(long, env = "MAPSTORE_POSTGRES_URL")]
    postgres_url: Option<String>,

    /// Table (and map) name
    #[arg(long, env = "MAPSTORE_TABLE", default_value = "entries")]
    table: String,

    /// Write-behind delay in milliseconds
    #[arg(long, env = "MAPSTORE_WRITE_DELAY_MS", default_value_t = 1000)]
    write_delay_ms: u64,

    /// Backing store call timeout in milliseconds
    #[arg(long, env = "MAPSTORE_STORE_TIMEOUT_MS", default_value_t = 30_000)]
    store_timeout_ms: u64,

    /// Load keys on first access instead of at startup
    #[arg(long, env = "MAPSTORE_LAZY")]
    lazy: bool,

    /// Log level (trace / debug / info / warn / error); `RUST_LOG` wins
    #[arg(long, env = "MAPSTORE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "MAPSTORE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store a JSON value
    Put { key: String, value: String },
    /// Print a value
    Get {
        key: String,
        /// Also print version, timestamps and origin of the resident entry
        #[arg(long)]
        meta: bool,
    },
    /// Delete a key
    Remove { key: String },
    /// List resident keys
    Keys,
    /// List keys whose value has `field` equal to `equals`
    Scan {
        #[arg(long)]
        field: String,
        #[arg(long)]
        equals: String,
        #[arg(long)]
        ignore_case: bool,
    },
    /// Keep the cache open until Ctrl-C
    Serve,
}

// ── Setup ─────────────────────────────────────────────────────────────────────

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(args: &Args) -> Result<Arc<dyn BackingStore>> {
    let store: Arc<dyn BackingStore> = match args.backend {
        Backend::Memory => Arc::new(InMemoryStore::new()),
        #[cfg(feature = "redb")]
        Backend::Redb => Arc::new(
            RedbStore::open(&args.redb_path, &args.table)
                .with_context(|| format!("open redb store {:?}", args.redb_path))?,
        ),
        #[cfg(feature = "postgres")]
        Backend::Postgres => {
            let url = args
                .postgres_url
                .as_deref()
                .context("--postgres-url is required for the postgres backend")?;
            Arc::new(
                PostgresStore::connect(
                    url,
                    &args.table,
                    8,
                    Duration::from_millis(args.store_timeout_ms),
                )
                .await
                .context("connect postgres store")?,
            )
        }
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("backend {other:?} is not compiled in"),
    };
    Ok(store)
}

fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

async fn run(cache: &MapCache<String, Value>, command: Command) -> Result<()> {
    match command {
        Command::Put { key, value } => {
            let previous = cache.put(key, parse_value(&value))?;
            if let Some(previous) = previous {
                println!("{}", serde_json::to_string_pretty(&*previous)?);
            }
        }
        Command::Get { key, meta } => match cache.get(&key).await {
            Some(value) => {
                println!("{}", serde_json::to_string_pretty(&*value)?);
                if let Some(entry) = meta.then(|| cache.entry(&key)).flatten() {
                    let m = &entry.metadata;
                    println!(
                        "version={} created={} updated={} origin={:?}",
                        m.version, m.creation_time, m.last_update_time, m.provenance
                    );
                }
            }
            None => println!("(absent)"),
        },
        Command::Remove { key } => {
            let removed = cache.remove(&key)?;
            println!("{}", if removed.is_some() { "removed" } else { "(absent)" });
        }
        Command::Keys => {
            let mut keys = cache.keys();
            keys.sort();
            for key in keys {
                println!("{key}");
            }
        }
        Command::Scan {
            field,
            equals,
            ignore_case,
        } => {
            let mut predicate = FieldEquals::new(&field, parse_value(&equals));
            if ignore_case {
                predicate = predicate.ignore_case();
            }
            let mut keys: Vec<String> = cache.scan_by_value(&predicate).await.into_iter().collect();
            keys.sort();
            for key in keys {
                println!("{key}");
            }
        }
        Command::Serve => {
            info!(map = cache.map_name(), resident = cache.len(), "serving until Ctrl-C");
            tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
        }
    }
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let store = open_store(&args).await?;
    let config = CacheConfig::new(args.table.clone())
        .with_write_delay(Duration::from_millis(args.write_delay_ms))
        .with_store_timeout(Duration::from_millis(args.store_timeout_ms))
        .with_initial_load(if args.lazy {
            InitialLoadMode::Lazy
        } else {
            InitialLoadMode::Eager
        });

    let cache = MapCacheFactory::<String, Value>::new(config, store)
        .build()
        .await
        .context("start cache")?;

    let outcome = run(&cache, args.command).await;
    cache.shutdown().await.context("flush pending writes")?;
    outcome
}
