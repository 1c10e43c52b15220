#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use bulk_import::config::ImportConfig;
use bulk_import::data::Value;
use bulk_import::engine::ImportEngine;
use bulk_import::store::{
    ColumnDef, ColumnInfo, SqliteStore, Store, StoreError, StoreRow,
};
use tempfile::{TempDir, tempdir};

pub const ATTRIBUTION: &str = "importer@example.com";

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// Path of a SQLite database inside the workspace (not created yet).
    pub fn db(&self) -> PathBuf {
        self.temp_dir.path().join("store.db")
    }
}

pub fn memory_engine() -> ImportEngine<SqliteStore> {
    ImportEngine::new(
        SqliteStore::open_in_memory().expect("in-memory store"),
        ImportConfig::default(),
    )
    .expect("default config is valid")
}

pub fn engine_over<S: Store>(store: S) -> ImportEngine<S> {
    ImportEngine::new(store, ImportConfig::default()).expect("default config is valid")
}

/// Reads `column` for every row of `table`, ordered by `order_by`.
pub fn column_values<S: Store>(store: &S, table: &str, column: &str, order_by: &str) -> Vec<Option<Value>> {
    store
        .query(
            &format!("SELECT \"{column}\" AS v FROM \"{table}\" ORDER BY \"{order_by}\""),
            &[],
        )
        .expect("select column")
        .into_iter()
        .map(|mut row| row.remove("v").flatten())
        .collect()
}

pub fn text(value: &Option<Value>) -> String {
    value.as_ref().map(Value::as_display).unwrap_or_default()
}

/// Wraps a store and injects failures into selected statement shapes.
pub struct FaultyStore<S> {
    pub inner: S,
    /// Fail INSERT statements carrying more than one VALUES tuple.
    pub fail_bulk_insert: bool,
    /// Fail CASE-driven bulk UPDATE statements.
    pub fail_bulk_update: bool,
    /// Fail `id IN (...)` existence lookups.
    pub fail_bulk_lookup: bool,
    /// Fail single-key existence lookups.
    pub fail_single_lookup: bool,
    /// Report only the baseline columns from `table_schema`, as a reader
    /// racing a concurrent `ALTER TABLE` would.
    pub stale_schema: bool,
    pub queries: AtomicUsize,
    pub executes: AtomicUsize,
}

impl<S: Store> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_bulk_insert: false,
            fail_bulk_update: false,
            fail_bulk_lookup: false,
            fail_single_lookup: false,
            stale_schema: false,
            queries: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
        }
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn execute_count(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    fn injected(what: &str) -> StoreError {
        StoreError::Backend(format!("injected failure: {what}"))
    }
}

impl<S: Store> Store for FaultyStore<S> {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        self.inner.table_exists(table)
    }

    fn table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let schema = self.inner.table_schema(table)?;
        if self.stale_schema {
            return Ok(schema.into_iter().take(4).collect());
        }
        Ok(schema)
    }

    fn create_table(&self, table: &str, columns: &[ColumnDef]) -> Result<(), StoreError> {
        self.inner.create_table(table, columns)
    }

    fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StoreError> {
        self.inner.add_column(table, column)
    }

    fn query(&self, sql: &str, params: &[Option<Value>]) -> Result<Vec<StoreRow>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_bulk_lookup && sql.contains(" IN (") {
            return Err(Self::injected("bulk lookup"));
        }
        if self.fail_single_lookup && sql.contains("LIMIT 1") {
            return Err(Self::injected("single lookup"));
        }
        self.inner.query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Option<Value>]) -> Result<usize, StoreError> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        if self.fail_bulk_insert && sql.starts_with("INSERT") && sql.contains("), (") {
            return Err(Self::injected("bulk insert"));
        }
        if self.fail_bulk_update && sql.starts_with("UPDATE") && sql.contains("CASE") {
            return Err(Self::injected("bulk update"));
        }
        self.inner.execute(sql, params)
    }

    fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_tables()
    }

    fn max_parameters(&self) -> usize {
        self.inner.max_parameters()
    }
}
