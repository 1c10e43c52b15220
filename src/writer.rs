//! Bulk SQL synthesis and execution.
//!
//! Inserts go out as one multi-row `VALUES` list per chunk. Updates go out as
//! one `UPDATE` per chunk with a `CASE WHEN id = ? THEN ? ... ELSE col END`
//! expression for every payload column, so rows touching different column
//! subsets share a single round trip. Rows repeating an identity are merged
//! into one before chunking, later values winning per column. Both paths
//! degrade to row-at-a-time statements through [`try_batched`] when the bulk
//! statement fails.
//!
//! Chunks are bounded by the configured batch size and by the store's bind
//! parameter limit. An optional deadline is checked before each chunk.

use std::{collections::HashMap, time::Instant};

use chrono::Utc;
use itertools::Itertools;
use log::{debug, error, info, warn};

use crate::{
    classify::PendingRow,
    data::Value,
    identity::{IdentityKey, identity_operand},
    schema::{ATTRIBUTION_COLUMN, CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN},
    store::{Store, StoreError, placeholders, quote_ident},
};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub fallback_used: bool,
    pub failures: usize,
}

/// Runs `batched` over all of `items`; if it fails, runs `single` for each
/// item instead and counts the items it reports as written. Nothing is retried
/// beyond that one degradation.
pub fn try_batched<T, B, S>(items: &[T], batched: B, mut single: S) -> BatchOutcome
where
    B: FnOnce(&[T]) -> Result<usize, StoreError>,
    S: FnMut(&T) -> Result<bool, StoreError>,
{
    if items.is_empty() {
        return BatchOutcome::default();
    }
    match batched(items) {
        Ok(succeeded) => BatchOutcome {
            succeeded,
            fallback_used: false,
            failures: 0,
        },
        Err(err) => {
            error!("Bulk statement for {} row(s) failed: {err}", items.len());
            info!("Falling back to row-at-a-time execution");
            let mut outcome = BatchOutcome {
                fallback_used: true,
                ..BatchOutcome::default()
            };
            for item in items {
                match single(item) {
                    Ok(true) => outcome.succeeded += 1,
                    Ok(false) => {}
                    Err(err) => {
                        error!("Row-at-a-time statement also failed: {err}");
                        outcome.failures += 1;
                    }
                }
            }
            outcome
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: usize,
    pub statements: usize,
    pub fallback_used: bool,
    pub failures: usize,
    /// Rows never attempted because the deadline passed.
    pub unwritten: usize,
}

impl WriteSummary {
    fn absorb(&mut self, outcome: BatchOutcome) {
        self.written += outcome.succeeded;
        self.statements += 1;
        self.fallback_used |= outcome.fallback_used;
        self.failures += outcome.failures;
    }
}

struct Statement {
    sql: String,
    params: Vec<Option<Value>>,
}

pub struct BulkWriter<'a, S: Store + ?Sized> {
    store: &'a S,
    table: &'a str,
    attribution: &'a str,
    batch_size: usize,
    deadline: Option<Instant>,
}

impl<'a, S: Store + ?Sized> BulkWriter<'a, S> {
    pub fn new(store: &'a S, table: &'a str, attribution: &'a str, batch_size: usize) -> Self {
        Self {
            store,
            table,
            attribution,
            batch_size: batch_size.max(1),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn write_inserts(&self, rows: &[PendingRow]) -> WriteSummary {
        let columns = payload_columns(rows);
        let now = now();
        let per_statement = self.rows_per_statement(columns.len() + 4, 0);
        debug!(
            "Inserting {} row(s) into '{}' across {} column(s), {} per statement",
            rows.len(),
            self.table,
            columns.len(),
            per_statement
        );
        self.run_chunks(rows, per_statement, |chunk| {
            try_batched(
                chunk,
                |items| {
                    let statement = self.insert_statement(&columns, items, &now);
                    self.store.execute(&statement.sql, &statement.params)
                },
                |row| {
                    let own = row.payload.iter().map(|(name, _)| name.as_str()).collect_vec();
                    let statement = self.insert_statement(&own, std::slice::from_ref(row), &now);
                    Ok(self.store.execute(&statement.sql, &statement.params)? > 0)
                },
            )
        })
    }

    pub fn write_updates(&self, rows: &[PendingRow]) -> WriteSummary {
        let merged = merge_by_key(rows);
        let rows = merged.as_slice();
        let columns = payload_columns(rows);
        let now = now();
        let per_statement = self.rows_per_statement(2 * columns.len() + 1, 2);
        debug!(
            "Updating {} row(s) in '{}' across {} column(s), {} per statement",
            rows.len(),
            self.table,
            columns.len(),
            per_statement
        );
        self.run_chunks(rows, per_statement, |chunk| {
            try_batched(
                chunk,
                |items| {
                    let statement = self.update_statement(items, &now);
                    self.store.execute(&statement.sql, &statement.params)
                },
                |row| {
                    let statement = self.update_one_statement(row, &now);
                    Ok(self.store.execute(&statement.sql, &statement.params)? > 0)
                },
            )
        })
    }

    fn rows_per_statement(&self, params_per_row: usize, fixed_params: usize) -> usize {
        let budget = self.store.max_parameters().saturating_sub(fixed_params);
        (budget / params_per_row.max(1)).clamp(1, self.batch_size)
    }

    fn run_chunks<F>(&self, rows: &[PendingRow], per_statement: usize, mut op: F) -> WriteSummary
    where
        F: FnMut(&[PendingRow]) -> BatchOutcome,
    {
        let mut summary = WriteSummary::default();
        let mut done = 0;
        for chunk in rows.chunks(per_statement) {
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                summary.unwritten = rows.len() - done;
                warn!(
                    "Deadline reached; {} row(s) for '{}' left unwritten",
                    summary.unwritten, self.table
                );
                break;
            }
            summary.absorb(op(chunk));
            done += chunk.len();
        }
        summary
    }

    fn insert_statement<C: AsRef<str>>(
        &self,
        columns: &[C],
        rows: &[PendingRow],
        now: &Value,
    ) -> Statement {
        let column_list = std::iter::once(ID_COLUMN)
            .chain(columns.iter().map(|column| column.as_ref()))
            .chain([CREATED_AT_COLUMN, UPDATED_AT_COLUMN, ATTRIBUTION_COLUMN])
            .map(quote_ident)
            .join(", ");
        let tuple = format!("({})", placeholders(columns.len() + 4));
        let sql = format!(
            "INSERT INTO {} ({column_list}) VALUES {}",
            quote_ident(self.table),
            std::iter::repeat_n(tuple.as_str(), rows.len()).join(", ")
        );
        let mut params = Vec::with_capacity(rows.len() * (columns.len() + 4));
        for row in rows {
            params.push(Some(row.key.to_value()));
            for column in columns {
                params.push(lookup(row, column.as_ref()).cloned());
            }
            params.push(Some(now.clone()));
            params.push(Some(now.clone()));
            params.push(Some(Value::from(self.attribution)));
        }
        Statement { sql, params }
    }

    fn update_statement(&self, rows: &[PendingRow], now: &Value) -> Statement {
        let id = identity_operand();
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for column in payload_columns(rows) {
            let quoted = quote_ident(column);
            let mut arms = String::new();
            for row in rows {
                if let Some(value) = lookup(row, column) {
                    arms.push_str(&format!(" WHEN {id} = ? THEN ?"));
                    params.push(Some(row.key.to_value()));
                    params.push(Some(value.clone()));
                }
            }
            assignments.push(format!("{quoted} = CASE{arms} ELSE {quoted} END"));
        }
        assignments.push(format!("{} = ?", quote_ident(UPDATED_AT_COLUMN)));
        assignments.push(format!("{} = ?", quote_ident(ATTRIBUTION_COLUMN)));
        params.push(Some(now.clone()));
        params.push(Some(Value::from(self.attribution)));

        params.extend(rows.iter().map(|row| Some(row.key.to_value())));
        let sql = format!(
            "UPDATE {} SET {} WHERE {id} IN ({})",
            quote_ident(self.table),
            assignments.join(", "),
            placeholders(rows.len())
        );
        Statement { sql, params }
    }

    fn update_one_statement(&self, row: &PendingRow, now: &Value) -> Statement {
        let assignments = row
            .payload
            .iter()
            .map(|(name, _)| name.as_str())
            .chain([UPDATED_AT_COLUMN, ATTRIBUTION_COLUMN])
            .map(|name| format!("{} = ?", quote_ident(name)))
            .join(", ");
        let mut params = row
            .payload
            .iter()
            .map(|(_, value)| Some(value.clone()))
            .collect_vec();
        params.push(Some(now.clone()));
        params.push(Some(Value::from(self.attribution)));
        params.push(Some(row.key.to_value()));
        Statement {
            sql: format!(
                "UPDATE {} SET {assignments} WHERE {} = ?",
                quote_ident(self.table),
                identity_operand()
            ),
            params,
        }
    }
}

fn now() -> Value {
    Value::Timestamp(Utc::now().naive_utc())
}

fn lookup<'r>(row: &'r PendingRow, column: &str) -> Option<&'r Value> {
    row.payload
        .iter()
        .find(|(name, _)| name == column)
        .map(|(_, value)| value)
}

/// One row per key in first-seen order. A repeated key folds its payload into
/// the earlier row, overwriting columns it shares.
fn merge_by_key(rows: &[PendingRow]) -> Vec<PendingRow> {
    let mut merged: Vec<PendingRow> = Vec::with_capacity(rows.len());
    let mut positions: HashMap<IdentityKey, usize> = HashMap::with_capacity(rows.len());
    for row in rows {
        let Some(&at) = positions.get(&row.key) else {
            positions.insert(row.key, merged.len());
            merged.push(row.clone());
            continue;
        };
        let payload = &mut merged[at].payload;
        for (name, value) in &row.payload {
            match payload.iter_mut().find(|(existing, _)| existing == name) {
                Some((_, slot)) => *slot = value.clone(),
                None => payload.push((name.clone(), value.clone())),
            }
        }
    }
    merged
}

/// Union of payload column names in first-seen order.
fn payload_columns(rows: &[PendingRow]) -> Vec<&str> {
    rows.iter()
        .flat_map(|row| row.payload.iter().map(|(name, _)| name.as_str()))
        .unique()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::{SchemaManager, TypeInference},
        store::SqliteStore,
    };

    fn pending(row: usize, payload: &[(&str, Value)]) -> PendingRow {
        PendingRow {
            row,
            key: IdentityKey::generate(),
            payload: payload
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        }
    }

    fn products() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        SchemaManager::new(&store, &TypeInference::default())
            .ensure("products", &["name".to_string(), "price".to_string()])
            .unwrap();
        store
    }

    fn value_of(store: &SqliteStore, key: IdentityKey, column: &str) -> Option<Value> {
        let rows = store
            .query(
                &format!("SELECT {column} AS v FROM products WHERE id = ?"),
                &[Some(key.to_value())],
            )
            .unwrap();
        rows[0]["v"].clone()
    }

    #[test]
    fn try_batched_prefers_the_bulk_path() {
        let outcome = try_batched(&[1, 2, 3], |items| Ok(items.len()), |_| panic!("no fallback"));
        assert_eq!(
            outcome,
            BatchOutcome {
                succeeded: 3,
                fallback_used: false,
                failures: 0
            }
        );
    }

    #[test]
    fn try_batched_counts_individual_successes() {
        let outcome = try_batched(
            &[1, -2, 3, 0],
            |_| Err(StoreError::Backend("boom".into())),
            |item| match item {
                n if *n > 0 => Ok(true),
                0 => Ok(false),
                _ => Err(StoreError::Backend("bad row".into())),
            },
        );
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failures, 1);
        assert!(outcome.fallback_used);
    }

    #[test]
    fn insert_statement_covers_union_of_columns() {
        let store = products();
        let writer = BulkWriter::new(&store, "products", "ops@example.com", 500);
        let rows = vec![
            pending(1, &[("name", Value::from("Widget"))]),
            pending(2, &[("price", Value::Float(2.5)), ("name", Value::from("Gadget"))]),
        ];
        let columns = payload_columns(&rows);
        assert_eq!(columns, vec!["name", "price"]);
        let statement = writer.insert_statement(&columns, &rows, &now());
        assert_eq!(
            statement.sql,
            "INSERT INTO \"products\" (\"id\", \"name\", \"price\", \"created_at\", \"updated_at\", \"auth_email\") \
             VALUES (?, ?, ?, ?, ?, ?), (?, ?, ?, ?, ?, ?)"
        );
        assert_eq!(statement.params.len(), 12);
        assert_eq!(statement.params[2], None);

        let summary = writer.write_inserts(&rows);
        assert_eq!(summary.written, 2);
        assert_eq!(summary.statements, 1);
        assert!(!summary.fallback_used);
        assert_eq!(value_of(&store, rows[1].key, "price"), Some(Value::Float(2.5)));
        assert_eq!(
            value_of(&store, rows[0].key, "auth_email"),
            Some(Value::from("ops@example.com"))
        );
    }

    #[test]
    fn update_uses_case_per_column_and_leaves_other_columns() {
        let store = products();
        let writer = BulkWriter::new(&store, "products", "seed", 500);
        let rows = vec![
            pending(1, &[("name", Value::from("A")), ("price", Value::Float(1.5))]),
            pending(2, &[("name", Value::from("B")), ("price", Value::Float(2.25))]),
        ];
        writer.write_inserts(&rows);

        let updates = vec![
            PendingRow {
                row: 1,
                key: rows[0].key,
                payload: vec![("price".into(), Value::Float(10.5))],
            },
            PendingRow {
                row: 2,
                key: rows[1].key,
                payload: vec![("name".into(), Value::from("B2"))],
            },
        ];
        let statement = writer.update_statement(&updates, &now());
        assert!(statement.sql.starts_with(
            "UPDATE \"products\" SET \"price\" = CASE WHEN \"id\" COLLATE NOCASE = ? THEN ? ELSE \"price\" END, \
             \"name\" = CASE WHEN \"id\" COLLATE NOCASE = ? THEN ? ELSE \"name\" END"
        ));
        assert!(statement.sql.ends_with("WHERE \"id\" COLLATE NOCASE IN (?, ?)"));

        let updater = BulkWriter::new(&store, "products", "editor", 500);
        let summary = updater.write_updates(&updates);
        assert_eq!(summary.written, 2);
        assert_eq!(value_of(&store, rows[0].key, "price"), Some(Value::Float(10.5)));
        assert_eq!(value_of(&store, rows[0].key, "name"), Some(Value::from("A")));
        assert_eq!(value_of(&store, rows[1].key, "name"), Some(Value::from("B2")));
        assert_eq!(value_of(&store, rows[1].key, "price"), Some(Value::Float(2.25)));
        assert_eq!(
            value_of(&store, rows[1].key, "auth_email"),
            Some(Value::from("editor"))
        );
    }

    #[test]
    fn repeated_update_key_keeps_last_value() {
        let store = products();
        let writer = BulkWriter::new(&store, "products", "seed", 500);
        let original = pending(1, &[("name", Value::from("A"))]);
        writer.write_inserts(std::slice::from_ref(&original));
        let updates = ["first", "second"]
            .iter()
            .enumerate()
            .map(|(i, name)| PendingRow {
                row: i + 1,
                key: original.key,
                payload: vec![("name".into(), Value::from(*name))],
            })
            .collect_vec();
        let summary = writer.write_updates(&updates);
        assert_eq!(summary.written, 1);
        assert_eq!(value_of(&store, original.key, "name"), Some(Value::from("second")));
    }

    #[test]
    fn repeated_key_across_chunks_counts_once() {
        let store = products();
        let writer = BulkWriter::new(&store, "products", "seed", 1);
        let original = pending(1, &[("name", Value::from("A")), ("price", Value::Float(1.5))]);
        writer.write_inserts(std::slice::from_ref(&original));
        let updates = vec![
            PendingRow {
                row: 1,
                key: original.key,
                payload: vec![("name".into(), Value::from("B")), ("price".into(), Value::Float(2.5))],
            },
            PendingRow {
                row: 2,
                key: original.key,
                payload: vec![("name".into(), Value::from("C"))],
            },
        ];
        let summary = writer.write_updates(&updates);
        assert_eq!(summary.written, 1);
        assert_eq!(summary.statements, 1);
        assert_eq!(value_of(&store, original.key, "name"), Some(Value::from("C")));
        assert_eq!(value_of(&store, original.key, "price"), Some(Value::Float(2.5)));
    }

    #[test]
    fn updates_match_ids_stored_in_upper_case() {
        let store = products();
        let key = IdentityKey::generate();
        store
            .execute(
                "INSERT INTO products (id, name, auth_email) VALUES (?, 'A', 'legacy')",
                &[Some(Value::Text(key.to_string().to_uppercase()))],
            )
            .unwrap();
        let writer = BulkWriter::new(&store, "products", "editor", 500);
        let updates = vec![PendingRow {
            row: 1,
            key,
            payload: vec![("name".into(), Value::from("B"))],
        }];
        assert_eq!(writer.write_updates(&updates).written, 1);
        let single = writer.update_one_statement(&updates[0], &now());
        assert!(single.sql.ends_with("WHERE \"id\" COLLATE NOCASE = ?"));
        let rows = store.query("SELECT name FROM products", &[]).unwrap();
        assert_eq!(rows[0]["name"], Some(Value::from("B")));
    }

    #[test]
    fn chunks_respect_batch_size() {
        let store = products();
        let writer = BulkWriter::new(&store, "products", "seed", 2);
        let rows = (0..5)
            .map(|i| pending(i + 1, &[("name", Value::from(format!("n{i}")))]))
            .collect_vec();
        let summary = writer.write_inserts(&rows);
        assert_eq!(summary.statements, 3);
        assert_eq!(summary.written, 5);
        assert_eq!(store.count_rows("products").unwrap(), 5);
    }

    #[test]
    fn expired_deadline_writes_nothing() {
        let store = products();
        let writer = BulkWriter::new(&store, "products", "seed", 500).with_deadline(Some(Instant::now()));
        let rows = vec![pending(1, &[("name", Value::from("late"))])];
        let summary = writer.write_inserts(&rows);
        assert_eq!(summary.written, 0);
        assert_eq!(summary.unwritten, 1);
        assert_eq!(store.count_rows("products").unwrap(), 0);
    }

    #[test]
    fn failing_row_falls_back_and_others_land() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute(
                "CREATE TABLE guarded (id TEXT PRIMARY KEY NOT NULL, created_at TIMESTAMP, \
                 updated_at TIMESTAMP, auth_email VARCHAR(255) NOT NULL, price NUMERIC CHECK (price >= 0))",
                &[],
            )
            .unwrap();
        let writer = BulkWriter::new(&store, "guarded", "seed", 500);
        let rows = vec![
            pending(1, &[("price", Value::Float(1.0))]),
            pending(2, &[("price", Value::Float(-1.0))]),
            pending(3, &[("price", Value::Float(3.0))]),
        ];
        let summary = writer.write_inserts(&rows);
        assert!(summary.fallback_used);
        assert_eq!(summary.written, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(store.count_rows("guarded").unwrap(), 2);
    }
}
