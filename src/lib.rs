pub mod classify;
pub mod cli;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod identity;
pub mod io_utils;
pub mod report;
pub mod sanitize;
pub mod schema;
pub mod source;
pub mod store;
pub mod writer;

use std::{env, sync::OnceLock, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, Commands, DatabaseArgs},
    config::ImportConfig,
    engine::ImportEngine,
    report::ImportResult,
    source::{SourceFormat, SourceOptions},
    store::{SqliteStore, Store},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("bulk_import", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Import(args) => handle_import(&args),
        Commands::Tables(args) => handle_tables(&args.database),
        Commands::Schema(args) => handle_schema(&args),
        Commands::Config(args) => handle_config(&args),
    }
}

fn open_store(args: &DatabaseArgs) -> Result<SqliteStore> {
    SqliteStore::open(&args.db, Duration::from_millis(args.busy_timeout_ms))
        .with_context(|| format!("Opening database {:?}", args.db))
}

fn handle_import(args: &cli::ImportArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ImportConfig::load(path)?,
        None => ImportConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(timeout) = args.timeout_secs {
        config.timeout_secs = Some(timeout);
    }

    let name = args.input.to_string_lossy().into_owned();
    let format = match args.format {
        Some(format) => Ok(SourceFormat::from(format)),
        None if io_utils::is_dash(&args.input) => {
            bail!("--format is required when reading from stdin")
        }
        None => SourceFormat::from_filename(&name),
    };
    let options = SourceOptions {
        delimiter: io_utils::delimiter_for_name(&name, args.delimiter),
        encoding: io_utils::resolve_encoding(args.input_encoding.as_deref())?,
    };
    info!(
        "Importing '{}' into table '{}' of {:?} with delimiter '{}'",
        name,
        args.table,
        args.database.db,
        printable_delimiter(options.delimiter)
    );

    let store = open_store(&args.database)?;
    let engine = ImportEngine::new(store, config).context("Invalid import configuration")?;
    let result = match format {
        Ok(format) => {
            let bytes = io_utils::read_input(&args.input)?;
            engine.import_bytes(&bytes, format, &options, &args.table, &args.attribution)
        }
        Err(err) => ImportResult::failure(&args.table, err.to_string()),
    };

    let security = engine.sanitizer().summary();
    if security.total_events > 0 {
        info!(
            "{} value(s) rejected by the sanitizer ({} injection attempt(s))",
            security.total_events, security.blocked_attempts
        );
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Serializing import result")?
    );
    if result.is_error() {
        return Err(anyhow!(result.message));
    }
    Ok(())
}

fn handle_tables(args: &DatabaseArgs) -> Result<()> {
    let store = open_store(args)?;
    let tables = store.list_tables().context("Listing tables")?;
    debug!("Found {} table(s) in {:?}", tables.len(), args.db);
    for table in tables {
        let rows = store
            .count_rows(&table)
            .with_context(|| format!("Counting rows in '{table}'"))?;
        println!("{table}\t{rows}");
    }
    Ok(())
}

fn handle_schema(args: &cli::SchemaArgs) -> Result<()> {
    let store = open_store(&args.database)?;
    if !store
        .table_exists(&args.table)
        .with_context(|| format!("Looking up table '{}'", args.table))?
    {
        bail!("Table '{}' does not exist", args.table);
    }
    let columns = store
        .table_schema(&args.table)
        .with_context(|| format!("Reading schema of '{}'", args.table))?;
    for column in columns {
        println!("{}\t{}", column.name, column.declared_type);
    }
    Ok(())
}

fn handle_config(args: &cli::ConfigArgs) -> Result<()> {
    ImportConfig::default()
        .save(&args.output)
        .with_context(|| format!("Writing configuration to {:?}", args.output))?;
    info!("Default configuration written to {:?}", args.output);
    Ok(())
}

pub(crate) fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        b'\n' => "\\n".to_string(),
        other => (other as char).to_string(),
    }
}
