use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use log::debug;
use rusqlite::{
    Connection, ToSql, params_from_iter,
    types::{ToSqlOutput, ValueRef},
};

use super::{ColumnDef, ColumnInfo, ColumnRole, Store, StoreError, StoreRow, quote_ident};
use crate::data::{TIMESTAMP_FORMAT, Value};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// SQLite-backed [`Store`]. The connection sits behind a mutex so one store
/// can be shared across threads importing into different tables.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("Opened SQLite store {path:?} (journal_mode={mode})");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn column_ddl(column: &ColumnDef) -> String {
    let name = quote_ident(&column.name);
    match column.role {
        ColumnRole::Identity => format!("{name} TEXT PRIMARY KEY NOT NULL"),
        ColumnRole::CreatedAt | ColumnRole::UpdatedAt => {
            format!("{name} {} DEFAULT CURRENT_TIMESTAMP", column.column_type)
        }
        ColumnRole::Attribution => format!("{name} {} NOT NULL", column.column_type),
        ColumnRole::Data => format!("{name} {}", column.column_type),
    }
}

impl Store for SqliteStore {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
        Ok(stmt.exists([table])?)
    }

    fn table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    declared_type: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn create_table(&self, table: &str, columns: &[ColumnDef]) -> Result<(), StoreError> {
        let body = columns.iter().map(column_ddl).collect::<Vec<_>>().join(", ");
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({body})", quote_ident(table));
        debug!("{sql}");
        self.lock()?.execute_batch(&sql)?;
        Ok(())
    }

    fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StoreError> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            column_ddl(column)
        );
        debug!("{sql}");
        match self.lock()?.execute_batch(&sql) {
            Err(err) if err.to_string().contains("duplicate column name") => Err(
                StoreError::AlreadyExists(format!("column {}.{}", table, column.name)),
            ),
            other => other.map_err(StoreError::from),
        }
    }

    fn query(&self, sql: &str, params: &[Option<Value>]) -> Result<Vec<StoreRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let names = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = StoreRow::with_capacity(names.len());
            for (idx, name) in names.iter().enumerate() {
                record.insert(name.clone(), value_from_ref(row.get_ref(idx)?));
            }
            records.push(record);
        }
        Ok(records)
    }

    fn execute(&self, sql: &str, params: &[Option<Value>]) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        Ok(conn.execute(sql, params_from_iter(params.iter()))?)
    }

    fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Float(f) => ToSqlOutput::from(*f),
            Value::Boolean(b) => ToSqlOutput::from(*b),
            Value::Timestamp(ts) => ToSqlOutput::from(ts.format(TIMESTAMP_FORMAT).to_string()),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> Option<Value> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(Value::Integer(i)),
        ValueRef::Real(f) => Some(Value::Float(f)),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(Value::Text(String::from_utf8_lossy(bytes).into_owned()))
        }
    }
}
