use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{source::SourceFormat, store::DEFAULT_BUSY_TIMEOUT_MS};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Bulk-import tabular files into a SQL table",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import a CSV, spreadsheet or JSON file, inserting new rows and updating rows whose id exists
    Import(ImportArgs),
    /// List the tables in a database with their row counts
    Tables(TablesArgs),
    /// Show the columns of one table
    Schema(SchemaArgs),
    /// Write the default import configuration to a YAML file
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Csv,
    Excel,
    Json,
}

impl From<FormatArg> for SourceFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Csv => SourceFormat::Csv,
            FormatArg::Excel => SourceFormat::Excel,
            FormatArg::Json => SourceFormat::Json,
        }
    }
}

#[derive(Debug, Args)]
pub struct DatabaseArgs {
    /// SQLite database file (created if missing)
    #[arg(long = "db")]
    pub db: PathBuf,
    /// How long to wait on a locked database, in milliseconds
    #[arg(long = "busy-timeout-ms", default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Input file, or `-` to read from stdin (requires --format)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Target table name
    #[arg(short = 't', long = "table")]
    pub table: String,
    #[command(flatten)]
    pub database: DatabaseArgs,
    /// Who performed the import; stamped on every written row
    #[arg(short = 'a', long = "attribution")]
    pub attribution: String,
    /// Input format (inferred from the file extension when omitted)
    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,
    /// YAML configuration file (see the `config` command)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Maximum rows per bulk statement (overrides the configuration)
    #[arg(long = "batch-size")]
    pub batch_size: Option<usize>,
    /// Stop starting new bulk statements after this many seconds
    #[arg(long = "timeout-secs")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Args)]
pub struct TablesArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,
}

#[derive(Debug, Args)]
pub struct SchemaArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,
    /// Table to describe
    #[arg(short = 't', long = "table")]
    pub table: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Destination YAML file
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_delimiter_accepts_names_and_characters() {
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter("semicolon").unwrap(), b';');
        assert_eq!(parse_delimiter("#").unwrap(), b'#');
        assert!(parse_delimiter("").is_err());
        assert!(parse_delimiter("ab").is_err());
        assert!(parse_delimiter("é").is_err());
    }

    #[test]
    fn import_arguments_parse() {
        let cli = Cli::try_parse_from([
            "bulk-import",
            "import",
            "-i",
            "-",
            "--table",
            "products",
            "--db",
            "store.db",
            "--attribution",
            "ops@example.com",
            "--format",
            "json",
            "--batch-size",
            "100",
        ])
        .unwrap();
        let Commands::Import(args) = cli.command else {
            panic!("expected import command");
        };
        assert_eq!(args.format, Some(FormatArg::Json));
        assert_eq!(args.batch_size, Some(100));
        assert_eq!(args.database.busy_timeout_ms, 5000);
    }
}
