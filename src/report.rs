//! The result returned from every import call.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::{identity::Resolution, schema::SchemaChange, source::SourceFormat, writer::WriteSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationPath {
    /// Every statement that ran was a bulk statement.
    Bulk,
    /// At least one bulk statement degraded to row-at-a-time writes.
    BulkWithFallback,
    /// Nothing reached the writer.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedRow {
    pub row: usize,
    pub identity: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub execution_time_seconds: f64,
    pub records_per_second: f64,
    pub optimization_path: OptimizationPath,
    pub bulk_identity_check: bool,
    pub bulk_insert_count: usize,
    pub bulk_update_count: usize,
    pub insert_fallback_used: bool,
    pub update_fallback_used: bool,
    pub bulk_operations_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResult {
    pub status: ImportStatus,
    pub message: String,
    pub source_format: Option<SourceFormat>,
    pub table: String,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub skipped_rows: usize,
    pub inserted: usize,
    pub updated: usize,
    pub dropped: Vec<DroppedRow>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub schema: Option<SchemaChange>,
    pub performance: Performance,
}

impl ImportResult {
    /// An error result for a call rejected before reaching the engine.
    pub fn failure(table: &str, message: impl Into<String>) -> Self {
        ReportBuilder::new(table).fail(message)
    }

    pub fn is_error(&self) -> bool {
        self.status == ImportStatus::Error
    }
}

/// Accumulates outcomes over one import call and stamps the timing at
/// [`ReportBuilder::finish`].
#[derive(Debug)]
pub struct ReportBuilder {
    started: Instant,
    table: String,
    source_format: Option<SourceFormat>,
    total_rows: usize,
    dropped: Vec<DroppedRow>,
    warnings: Vec<String>,
    errors: Vec<String>,
    schema: Option<SchemaChange>,
    bulk_identity_check: bool,
    inserts: WriteSummary,
    updates: WriteSummary,
}

impl ReportBuilder {
    pub fn new(table: &str) -> Self {
        Self::started_at(table, Instant::now())
    }

    pub fn started_at(table: &str, started: Instant) -> Self {
        Self {
            started,
            table: table.to_string(),
            source_format: None,
            total_rows: 0,
            dropped: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            schema: None,
            bulk_identity_check: false,
            inserts: WriteSummary::default(),
            updates: WriteSummary::default(),
        }
    }

    pub fn source(&mut self, format: SourceFormat, total_rows: usize) {
        self.source_format = Some(format);
        self.total_rows = total_rows;
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn warnings(&mut self, messages: impl IntoIterator<Item = String>) {
        self.warnings.extend(messages);
    }

    pub fn errors(&mut self, messages: impl IntoIterator<Item = String>) {
        self.errors.extend(messages);
    }

    pub fn dropped(&mut self, rows: impl IntoIterator<Item = DroppedRow>) {
        self.dropped.extend(rows);
    }

    pub fn schema(&mut self, change: SchemaChange) {
        self.schema = Some(change);
    }

    pub fn identity_check(&mut self, resolution: &Resolution) {
        self.bulk_identity_check = resolution.is_complete();
    }

    pub fn inserts(&mut self, summary: WriteSummary) {
        self.inserts = summary;
    }

    pub fn updates(&mut self, summary: WriteSummary) {
        self.updates = summary;
    }

    pub fn finish(self) -> ImportResult {
        let processed = self.inserts.written + self.updates.written;
        let status = if processed > 0 {
            ImportStatus::Success
        } else if !self.dropped.is_empty() || !self.warnings.is_empty() {
            ImportStatus::Warning
        } else {
            ImportStatus::Error
        };
        let message = match status {
            ImportStatus::Success => format!(
                "Imported {processed} of {} row(s) into '{}' ({} inserted, {} updated)",
                self.total_rows, self.table, self.inserts.written, self.updates.written
            ),
            ImportStatus::Warning => format!(
                "No rows were imported into '{}'; see warnings and dropped rows",
                self.table
            ),
            ImportStatus::Error => format!("No rows were imported into '{}'", self.table),
        };
        self.build(status, message, processed)
    }

    /// A call that aborted before any row was written.
    pub fn fail(mut self, message: impl Into<String>) -> ImportResult {
        let message = message.into();
        self.errors.push(message.clone());
        self.build(ImportStatus::Error, message, 0)
    }

    fn build(self, status: ImportStatus, message: String, processed: usize) -> ImportResult {
        let elapsed = self.started.elapsed().as_secs_f64();
        let records_per_second = if elapsed > 0.0 {
            processed as f64 / elapsed
        } else {
            0.0
        };
        let statements = self.inserts.statements + self.updates.statements;
        let fallback = self.inserts.fallback_used || self.updates.fallback_used;
        let optimization_path = match (statements, fallback) {
            (0, _) => OptimizationPath::None,
            (_, false) => OptimizationPath::Bulk,
            (_, true) => OptimizationPath::BulkWithFallback,
        };
        ImportResult {
            status,
            message,
            source_format: self.source_format,
            table: self.table,
            total_rows: self.total_rows,
            processed_rows: processed,
            skipped_rows: self.total_rows.saturating_sub(processed),
            inserted: self.inserts.written,
            updated: self.updates.written,
            dropped: self.dropped,
            warnings: self.warnings,
            errors: self.errors,
            schema: self.schema,
            performance: Performance {
                execution_time_seconds: round_to(elapsed, 2),
                records_per_second: round_to(records_per_second, 1),
                optimization_path,
                bulk_identity_check: self.bulk_identity_check,
                bulk_insert_count: self.inserts.written,
                bulk_update_count: self.updates.written,
                insert_fallback_used: self.inserts.fallback_used,
                update_fallback_used: self.updates.fallback_used,
                bulk_operations_used: statements > 0,
            },
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(rows: usize) -> WriteSummary {
        WriteSummary {
            written: rows,
            statements: 1,
            ..WriteSummary::default()
        }
    }

    #[test]
    fn status_prefers_success_then_warning() {
        let mut report = ReportBuilder::new("t");
        report.source(SourceFormat::Csv, 3);
        report.inserts(written(2));
        let result = report.finish();
        assert_eq!(result.status, ImportStatus::Success);
        assert_eq!(result.processed_rows, 2);
        assert_eq!(result.skipped_rows, 1);
        assert_eq!(result.performance.optimization_path, OptimizationPath::Bulk);

        let mut report = ReportBuilder::new("t");
        report.dropped([DroppedRow {
            row: 1,
            identity: "x".into(),
            reason: "invalid identity format".into(),
        }]);
        assert_eq!(report.finish().status, ImportStatus::Warning);

        let report = ReportBuilder::new("t");
        let result = report.finish();
        assert_eq!(result.status, ImportStatus::Error);
        assert_eq!(result.performance.optimization_path, OptimizationPath::None);
        assert!(!result.performance.bulk_operations_used);
    }

    #[test]
    fn fallback_is_reported_on_the_path() {
        let mut report = ReportBuilder::new("t");
        report.updates(WriteSummary {
            fallback_used: true,
            ..written(1)
        });
        let result = report.finish();
        assert!(result.performance.update_fallback_used);
        assert_eq!(
            result.performance.optimization_path,
            OptimizationPath::BulkWithFallback
        );
        assert_eq!(result.performance.bulk_update_count, 1);
    }

    #[test]
    fn result_serializes_with_stable_field_names() {
        let mut report = ReportBuilder::new("products");
        report.source(SourceFormat::Json, 1);
        report.inserts(written(1));
        let json = serde_json::to_value(report.finish()).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["source_format"], "json");
        assert_eq!(json["performance"]["optimization_path"], "bulk");
        assert!(json["performance"]["records_per_second"].is_number());
        assert!(json["dropped"].as_array().unwrap().is_empty());
    }

    #[test]
    fn failure_carries_message() {
        let result = ImportResult::failure("t", "Unsupported file type: .pdf");
        assert!(result.is_error());
        assert_eq!(result.message, "Unsupported file type: .pdf");
        assert_eq!(result.errors, vec!["Unsupported file type: .pdf".to_string()]);
        assert_eq!(result.total_rows, 0);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(99.96, 1), 100.0);
    }
}
