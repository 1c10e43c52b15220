//! Import pipeline orchestration.
//!
//! One call runs adapter → column planning → schema ensure → identity
//! resolution → classification → bulk write → report, sequentially. The
//! engine keeps no state between calls beyond the sanitizer's event log, so
//! one engine can serve concurrent imports into different tables.

use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    classify::{DataColumn, RowClassifier},
    config::ImportConfig,
    data::normalize_column_name,
    error::{ConfigError, ImportError},
    identity::IdentityResolver,
    io_utils,
    report::{ImportResult, ReportBuilder},
    sanitize::Sanitizer,
    schema::{self, ID_COLUMN, SchemaManager},
    source::{self, SourceFormat, SourceOptions, SourceTable},
    store::Store,
    writer::BulkWriter,
};

pub struct ImportEngine<S: Store> {
    store: S,
    config: ImportConfig,
    sanitizer: Sanitizer,
}

/// How the source columns map onto the target table.
#[derive(Debug, Default)]
struct ColumnPlan {
    identity_index: Option<usize>,
    data: Vec<DataColumn>,
    warnings: Vec<String>,
}

fn plan_columns(columns: &[String]) -> ColumnPlan {
    let mut plan = ColumnPlan::default();
    let mut seen = HashSet::new();
    for (index, raw) in columns.iter().enumerate() {
        let trimmed = raw.trim();
        let name = if schema::is_valid_identifier(trimmed) {
            trimmed.to_string()
        } else {
            let normalized = normalize_column_name(trimmed);
            plan.warnings.push(format!(
                "Column '{raw}' renamed to '{normalized}'"
            ));
            normalized
        };
        if name.eq_ignore_ascii_case(ID_COLUMN) {
            if plan.identity_index.is_none() {
                plan.identity_index = Some(index);
            } else {
                plan.warnings
                    .push(format!("Duplicate identity column '{raw}' ignored"));
            }
            continue;
        }
        if schema::is_baseline_column(&name) {
            plan.warnings.push(format!(
                "Column '{raw}' is managed by the importer and was ignored"
            ));
            continue;
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            plan.warnings
                .push(format!("Duplicate column '{raw}' ignored"));
            continue;
        }
        plan.data.push(DataColumn { index, name });
    }
    plan
}

impl<S: Store> ImportEngine<S> {
    pub fn new(store: S, config: ImportConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let sanitizer = Sanitizer::new(&config.sanitizer)?;
        Ok(Self {
            store,
            config,
            sanitizer,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    /// Imports an uploaded file, picking the adapter from its extension.
    pub fn import_file(
        &self,
        bytes: &[u8],
        filename: &str,
        table: &str,
        attribution: &str,
    ) -> ImportResult {
        let format = match SourceFormat::from_filename(filename) {
            Ok(format) => format,
            Err(err) => return abort(ReportBuilder::new(table), err),
        };
        let options = SourceOptions {
            delimiter: io_utils::delimiter_for_name(filename, None),
            ..SourceOptions::default()
        };
        self.import_bytes(bytes, format, &options, table, attribution)
    }

    pub fn import_bytes(
        &self,
        bytes: &[u8],
        format: SourceFormat,
        options: &SourceOptions,
        table: &str,
        attribution: &str,
    ) -> ImportResult {
        let started = Instant::now();
        match source::read_table(bytes, format, options) {
            Ok(source) => self.run(source, table, attribution, started),
            Err(err) => abort(ReportBuilder::started_at(table, started), err),
        }
    }

    /// Imports an already decoded table.
    pub fn import_table(&self, source: SourceTable, table: &str, attribution: &str) -> ImportResult {
        self.run(source, table, attribution, Instant::now())
    }

    fn run(&self, source: SourceTable, table: &str, attribution: &str, started: Instant) -> ImportResult {
        let deadline = self.config.timeout().map(|timeout| started + timeout);
        let mut report = ReportBuilder::started_at(table, started);
        report.source(source.format, source.row_count());

        if let Err(err) = schema::validate_table_name(table) {
            return abort(report, err);
        }
        let attribution = attribution.trim();
        if attribution.is_empty() {
            return abort(report, ImportError::MissingAttribution);
        }
        if source.rows.is_empty() {
            let err = ImportError::EmptySource {
                format: source.format.label().to_string(),
            };
            return abort(report, err);
        }

        let plan = plan_columns(&source.columns);
        report.warnings(plan.warnings);
        let names = plan
            .data
            .iter()
            .map(|column| column.name.clone())
            .collect::<Vec<_>>();
        info!(
            "Importing {} {} row(s) into '{table}' ({} data column(s), identity column {})",
            source.row_count(),
            source.format,
            names.len(),
            if plan.identity_index.is_some() { "present" } else { "absent" }
        );

        let change = match SchemaManager::new(&self.store, &self.config.type_inference)
            .ensure(table, &names)
        {
            Ok(change) => change,
            Err(source) => {
                let err = ImportError::Schema {
                    table: table.to_string(),
                    source,
                };
                return abort(report, err);
            }
        };
        report.schema(change);

        let classifier = RowClassifier::new(&self.sanitizer, &plan.data, plan.identity_index);
        let cells = classifier.identity_cells(&source.rows);
        let resolver = IdentityResolver::new(&self.store, table);
        let resolution = resolver.resolve(cells.iter().filter_map(|cell| cell.key()));
        report.identity_check(&resolution);

        let classification = classifier.classify(
            &source.rows,
            &cells,
            &resolution.membership,
            |key| resolver.exists(key),
        );
        debug!(
            "Classified: {} insert, {} update, {} dropped, {} error(s), {} fallback lookup(s)",
            classification.inserts.len(),
            classification.updates.len(),
            classification.dropped.len(),
            classification.errors.len(),
            classification.fallback_lookups
        );
        report.dropped(classification.dropped);
        report.warnings(classification.warnings);
        report.errors(classification.errors);

        let writer = BulkWriter::new(&self.store, table, attribution, self.config.batch_size)
            .with_deadline(deadline);
        let inserts = writer.write_inserts(&classification.inserts);
        let updates = writer.write_updates(&classification.updates);
        let unwritten = inserts.unwritten + updates.unwritten;
        if unwritten > 0 {
            report.warn(format!(
                "Timed out after {}s: {unwritten} row(s) were not written",
                self.config.timeout().unwrap_or(Duration::ZERO).as_secs()
            ));
        }
        report.inserts(inserts);
        report.updates(updates);

        let result = report.finish();
        info!(
            "Import into '{table}' finished with status {:?}: {} inserted, {} updated, {} dropped in {:.2}s",
            result.status,
            result.inserted,
            result.updated,
            result.dropped.len(),
            result.performance.execution_time_seconds
        );
        result
    }
}

fn abort(report: ReportBuilder, err: ImportError) -> ImportResult {
    warn!("Import aborted: {err}");
    report.fail(err.to_string())
}
