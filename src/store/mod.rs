//! The relational store the engine writes into.
//!
//! [`Store`] is the whole contract the import pipeline relies on; connection
//! pooling, transactions spanning calls, and dialect quirks stay behind it.
//! [`SqliteStore`] is the bundled backend.

mod sqlite;

use std::{collections::HashMap, sync::Arc};

use itertools::Itertools;
use thiserror::Error;

use crate::{data::Value, schema::ColumnType};

pub use sqlite::{DEFAULT_BUSY_TIMEOUT_MS, SqliteStore};

/// One result row, keyed by column name. `None` is SQL `NULL`.
pub type StoreRow = HashMap<String, Option<Value>>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The object a DDL statement tried to create is already present.
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection lock poisoned")]
    Poisoned,
    #[error("{0}")]
    Backend(String),
}

/// What a column is for; backends render baseline roles with their own
/// constraints and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Identity,
    CreatedAt,
    UpdatedAt,
    Attribution,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub role: ColumnRole,
}

impl ColumnDef {
    pub fn data(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            role: ColumnRole::Data,
        }
    }
}

/// A live column as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

pub trait Store {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    fn table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError>;

    /// Creates `table` unless it exists. Implementations may report a lost
    /// creation race as [`StoreError::AlreadyExists`].
    fn create_table(&self, table: &str, columns: &[ColumnDef]) -> Result<(), StoreError>;

    /// Adds one column. A column that is already present must surface as
    /// [`StoreError::AlreadyExists`].
    fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StoreError>;

    /// Runs a read statement.
    fn query(&self, sql: &str, params: &[Option<Value>]) -> Result<Vec<StoreRow>, StoreError>;

    /// Runs a write statement and returns the number of affected rows.
    fn execute(&self, sql: &str, params: &[Option<Value>]) -> Result<usize, StoreError>;

    fn list_tables(&self) -> Result<Vec<String>, StoreError>;

    fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        let rows = self.query(
            &format!("SELECT COUNT(*) AS row_count FROM {}", quote_ident(table)),
            &[],
        )?;
        match rows.first().and_then(|row| row.get("row_count")) {
            Some(Some(Value::Integer(count))) => Ok((*count).max(0) as u64),
            _ => Err(StoreError::Backend(format!(
                "COUNT(*) on {table} returned no integer"
            ))),
        }
    }

    /// Upper bound on bind parameters in a single statement.
    fn max_parameters(&self) -> usize {
        32_766
    }
}

impl<T: Store + ?Sized> Store for &T {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        (**self).table_exists(table)
    }

    fn table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        (**self).table_schema(table)
    }

    fn create_table(&self, table: &str, columns: &[ColumnDef]) -> Result<(), StoreError> {
        (**self).create_table(table, columns)
    }

    fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StoreError> {
        (**self).add_column(table, column)
    }

    fn query(&self, sql: &str, params: &[Option<Value>]) -> Result<Vec<StoreRow>, StoreError> {
        (**self).query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Option<Value>]) -> Result<usize, StoreError> {
        (**self).execute(sql, params)
    }

    fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        (**self).list_tables()
    }

    fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        (**self).count_rows(table)
    }

    fn max_parameters(&self) -> usize {
        (**self).max_parameters()
    }
}

impl<T: Store + ?Sized> Store for Arc<T> {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        (**self).table_exists(table)
    }

    fn table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        (**self).table_schema(table)
    }

    fn create_table(&self, table: &str, columns: &[ColumnDef]) -> Result<(), StoreError> {
        (**self).create_table(table, columns)
    }

    fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StoreError> {
        (**self).add_column(table, column)
    }

    fn query(&self, sql: &str, params: &[Option<Value>]) -> Result<Vec<StoreRow>, StoreError> {
        (**self).query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Option<Value>]) -> Result<usize, StoreError> {
        (**self).execute(sql, params)
    }

    fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        (**self).list_tables()
    }

    fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        (**self).count_rows(table)
    }

    fn max_parameters(&self) -> usize {
        (**self).max_parameters()
    }
}

/// Double-quotes an identifier. Callers validate names first; embedded quotes
/// are still doubled so a slip cannot break out of the identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `?, ?, ?` for `count` bind parameters.
pub fn placeholders(count: usize) -> String {
    std::iter::repeat_n("?", count).join(", ")
}
