//! Target-table schema management.
//!
//! Every managed table carries four baseline columns ([`ID_COLUMN`],
//! [`CREATED_AT_COLUMN`], [`UPDATED_AT_COLUMN`], [`ATTRIBUTION_COLUMN`]).
//! Data columns are typed from their *name* through an ordered
//! [`TypeInference`] rule list, and tables only ever grow:
//! [`SchemaManager::ensure`] creates a missing table or adds missing columns,
//! never altering or dropping what is already there.

use std::{collections::HashSet, fmt, str::FromStr};

use anyhow::{Result, anyhow};
use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{
    error::ImportError,
    store::{ColumnDef, ColumnRole, Store, StoreError},
};

pub const ID_COLUMN: &str = "id";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";
pub const ATTRIBUTION_COLUMN: &str = "auth_email";

pub const MAX_TABLE_NAME_LEN: usize = 100;

/// Declared SQL type of a managed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Numeric,
    Integer,
    Timestamp,
    Varchar(u32),
    Text,
}

impl ColumnType {
    pub fn variants() -> &'static [&'static str] {
        &["NUMERIC", "INTEGER", "TIMESTAMP", "VARCHAR(n)", "TEXT"]
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Numeric => f.write_str("NUMERIC"),
            ColumnType::Integer => f.write_str("INTEGER"),
            ColumnType::Timestamp => f.write_str("TIMESTAMP"),
            ColumnType::Varchar(len) => write!(f, "VARCHAR({len})"),
            ColumnType::Text => f.write_str("TEXT"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "numeric" | "decimal" => Ok(ColumnType::Numeric),
            "integer" | "int" | "bigint" => Ok(ColumnType::Integer),
            "timestamp" | "datetime" => Ok(ColumnType::Timestamp),
            "text" | "string" => Ok(ColumnType::Text),
            other if other.starts_with("varchar") => parse_varchar(value),
            _ => Err(anyhow!(
                "Unknown column type '{value}'. Supported types: {}",
                ColumnType::variants().join(", ")
            )),
        }
    }
}

fn parse_varchar(value: &str) -> Result<ColumnType> {
    let trimmed = value.trim();
    let inner = trimmed
        .get("varchar".len()..)
        .map(str::trim)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| anyhow!("VARCHAR type '{trimmed}' must look like VARCHAR(255)"))?;
    let len = inner
        .trim()
        .parse::<u32>()
        .map_err(|err| anyhow!("Invalid VARCHAR length in '{trimmed}': {err}"))?;
    if len == 0 {
        return Err(anyhow!("VARCHAR length must be positive"));
    }
    Ok(ColumnType::Varchar(len))
}

impl Serialize for ColumnType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        ColumnType::from_str(&token).map_err(|err| de::Error::custom(err.to_string()))
    }
}

/// Keywords matched as case-insensitive substrings of the column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRule {
    pub keywords: Vec<String>,
    #[serde(alias = "columnType", alias = "type")]
    pub column_type: ColumnType,
}

impl TypeRule {
    fn new(keywords: &[&str], column_type: ColumnType) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            column_type,
        }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_ascii_lowercase()))
    }
}

/// Column-name type heuristic. Rules are evaluated in order; the first match
/// wins and `fallback` applies when none does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeInference {
    pub rules: Vec<TypeRule>,
    pub fallback: ColumnType,
}

impl Default for TypeInference {
    fn default() -> Self {
        Self {
            rules: vec![
                TypeRule::new(&["price", "cost", "amount", "total"], ColumnType::Numeric),
                TypeRule::new(&["stock", "quantity", "count", "number"], ColumnType::Integer),
                TypeRule::new(&["date", "time", "created", "updated"], ColumnType::Timestamp),
                TypeRule::new(&["email", "url", "phone"], ColumnType::Varchar(255)),
            ],
            fallback: ColumnType::Text,
        }
    }
}

impl TypeInference {
    pub fn infer(&self, column: &str) -> ColumnType {
        let lowered = column.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| rule.column_type)
            .unwrap_or(self.fallback)
    }
}

pub fn baseline_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef {
            name: ID_COLUMN.to_string(),
            column_type: ColumnType::Text,
            role: ColumnRole::Identity,
        },
        ColumnDef {
            name: CREATED_AT_COLUMN.to_string(),
            column_type: ColumnType::Timestamp,
            role: ColumnRole::CreatedAt,
        },
        ColumnDef {
            name: UPDATED_AT_COLUMN.to_string(),
            column_type: ColumnType::Timestamp,
            role: ColumnRole::UpdatedAt,
        },
        ColumnDef {
            name: ATTRIBUTION_COLUMN.to_string(),
            column_type: ColumnType::Varchar(255),
            role: ColumnRole::Attribution,
        },
    ]
}

pub fn is_baseline_column(name: &str) -> bool {
    [
        ID_COLUMN,
        CREATED_AT_COLUMN,
        UPDATED_AT_COLUMN,
        ATTRIBUTION_COLUMN,
    ]
    .iter()
    .any(|baseline| baseline.eq_ignore_ascii_case(name))
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

pub fn validate_table_name(name: &str) -> Result<(), ImportError> {
    if name.len() > MAX_TABLE_NAME_LEN || !is_valid_identifier(name) {
        return Err(ImportError::InvalidTableName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableState {
    Unchanged,
    Created,
    Extended,
}

/// What [`SchemaManager::ensure`] did to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub state: TableState,
    pub added_columns: Vec<String>,
}

pub struct SchemaManager<'a, S: Store + ?Sized> {
    store: &'a S,
    inference: &'a TypeInference,
}

impl<'a, S: Store + ?Sized> SchemaManager<'a, S> {
    pub fn new(store: &'a S, inference: &'a TypeInference) -> Self {
        Self { store, inference }
    }

    /// Makes sure `table` exists and has every column in `observed`.
    ///
    /// A concurrent writer creating the same table or column first is not an
    /// error: [`StoreError::AlreadyExists`] counts as success.
    pub fn ensure(&self, table: &str, observed: &[String]) -> Result<SchemaChange, StoreError> {
        let data_columns = observed
            .iter()
            .filter(|name| !is_baseline_column(name))
            .collect::<Vec<_>>();

        let mut created = false;
        if !self.store.table_exists(table)? {
            let mut columns = baseline_columns();
            columns.extend(
                data_columns
                    .iter()
                    .map(|name| ColumnDef::data(name.as_str(), self.inference.infer(name))),
            );
            match self.store.create_table(table, &columns) {
                Ok(()) => {
                    info!(
                        "Created table '{table}' with {} data column(s)",
                        data_columns.len()
                    );
                    created = true;
                }
                Err(StoreError::AlreadyExists(what)) => {
                    debug!("{what} appeared concurrently; extending instead");
                }
                Err(err) => return Err(err),
            }
        }

        // A creation race can be lost silently by `CREATE TABLE IF NOT
        // EXISTS`, so the live schema is always compared afterwards.
        let added = self.add_missing(table, &data_columns)?;
        if created {
            Ok(SchemaChange {
                state: TableState::Created,
                added_columns: data_columns.iter().map(|name| name.to_string()).collect(),
            })
        } else if added.is_empty() {
            Ok(SchemaChange {
                state: TableState::Unchanged,
                added_columns: Vec::new(),
            })
        } else {
            Ok(SchemaChange {
                state: TableState::Extended,
                added_columns: added,
            })
        }
    }

    fn add_missing(&self, table: &str, columns: &[&String]) -> Result<Vec<String>, StoreError> {
        let live = self
            .store
            .table_schema(table)?
            .into_iter()
            .map(|column| column.name.to_ascii_lowercase())
            .collect::<HashSet<_>>();
        let mut added = Vec::new();
        for name in columns {
            if live.contains(&name.to_ascii_lowercase()) {
                continue;
            }
            let column_type = self.inference.infer(name);
            match self
                .store
                .add_column(table, &ColumnDef::data(name.as_str(), column_type))
            {
                Ok(()) => {
                    info!("Added column '{name}' ({column_type}) to '{table}'");
                    added.push(name.to_string());
                }
                Err(StoreError::AlreadyExists(what)) => {
                    debug!("{what} was added concurrently");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(added)
    }
}
