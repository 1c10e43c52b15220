//! Tabular source adapter.
//!
//! Turns an uploaded payload into a [`SourceTable`]: ordered column names plus
//! rows of best-effort typed cells. Three families are understood, dispatched
//! by file extension or by an explicit [`SourceFormat`]:
//!
//! - delimited text (`.csv`, `.tsv`, `.txt`) through the `csv` crate with
//!   optional input encoding,
//! - spreadsheets (`.xlsx`, `.xlsm`, `.xlsb`, `.xls`, `.ods`) through
//!   `calamine`, first worksheet only,
//! - JSON, either an array of record objects or an object of column arrays.
//!
//! Column order from the source is preserved.

use std::{fmt, io::Cursor, path::Path};

use calamine::{Data, Reader, open_workbook_auto_from_rs};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use encoding_rs::{Encoding, UTF_8};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    data::{ColumnTyping, Value, is_null_token, parse_cell, parse_timestamp},
    error::ImportError,
    io_utils,
};

const SUPPORTED_EXTENSIONS: &[(&str, SourceFormat)] = &[
    ("csv", SourceFormat::Csv),
    ("tsv", SourceFormat::Csv),
    ("txt", SourceFormat::Csv),
    ("xlsx", SourceFormat::Excel),
    ("xlsm", SourceFormat::Excel),
    ("xlsb", SourceFormat::Excel),
    ("xls", SourceFormat::Excel),
    ("ods", SourceFormat::Excel),
    ("json", SourceFormat::Json),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Excel,
    Json,
}

impl SourceFormat {
    pub fn from_filename(name: &str) -> Result<Self, ImportError> {
        let extension = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        SUPPORTED_EXTENSIONS
            .iter()
            .find(|(ext, _)| *ext == extension)
            .map(|(_, format)| *format)
            .ok_or_else(|| ImportError::UnsupportedFormat {
                extension: if extension.is_empty() {
                    "(none)".to_string()
                } else {
                    format!(".{extension}")
                },
                supported: SUPPORTED_EXTENSIONS
                    .iter()
                    .map(|(ext, _)| format!(".{ext}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "CSV",
            SourceFormat::Excel => "Excel",
            SourceFormat::Json => "JSON",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    pub delimiter: u8,
    pub encoding: &'static Encoding,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            delimiter: io_utils::DEFAULT_CSV_DELIMITER,
            encoding: UTF_8,
        }
    }
}

/// A decoded payload. Every row holds exactly `columns.len()` cells.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTable {
    pub format: SourceFormat,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Value>>>,
}

impl SourceTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

pub fn read_table(
    bytes: &[u8],
    format: SourceFormat,
    options: &SourceOptions,
) -> Result<SourceTable, ImportError> {
    let table = match format {
        SourceFormat::Csv => read_delimited(bytes, options)?,
        SourceFormat::Excel => read_spreadsheet(bytes)?,
        SourceFormat::Json => read_json(bytes)?,
    };
    if table.rows.is_empty() {
        return Err(ImportError::EmptySource {
            format: format.label().to_string(),
        });
    }
    debug!(
        "{} source decoded: {} row(s), columns {:?}",
        format,
        table.rows.len(),
        table.columns
    );
    Ok(table)
}

fn malformed(format: SourceFormat, detail: impl fmt::Display) -> ImportError {
    ImportError::MalformedInput {
        format: format.label().to_string(),
        detail: detail.to_string(),
    }
}

fn read_delimited(bytes: &[u8], options: &SourceOptions) -> Result<SourceTable, ImportError> {
    let format = SourceFormat::Csv;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ImportError::EmptySource {
            format: format.label().to_string(),
        });
    }
    let mut reader = io_utils::open_csv_reader(bytes, options.delimiter);
    let columns = io_utils::reader_headers(&mut reader, options.encoding)
        .map_err(|err| malformed(format, format!("header row: {err}")))?;

    let mut raw_rows = Vec::new();
    for (idx, record) in reader.byte_records().enumerate() {
        let record = record.map_err(|err| malformed(format, format!("row {}: {err}", idx + 2)))?;
        let decoded = io_utils::decode_record(&record, options.encoding)
            .map_err(|err| malformed(format, format!("row {}: {err}", idx + 2)))?;
        raw_rows.push(decoded);
    }

    let mut typings = vec![ColumnTyping::default(); columns.len()];
    for row in &raw_rows {
        for (typing, field) in typings.iter_mut().zip(row) {
            typing.observe(field);
        }
    }
    let types = typings.iter().map(ColumnTyping::decide).collect::<Vec<_>>();
    let rows = raw_rows
        .iter()
        .map(|row| {
            row.iter()
                .zip(&types)
                .map(|(field, ty)| parse_cell(field, *ty))
                .collect()
        })
        .collect();

    Ok(SourceTable {
        format,
        columns,
        rows,
    })
}

fn read_spreadsheet(bytes: &[u8]) -> Result<SourceTable, ImportError> {
    let format = SourceFormat::Excel;
    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|err| malformed(format, err))?;
    let range = match workbook.worksheet_range_at(0) {
        Some(range) => range.map_err(|err| malformed(format, err))?,
        None => {
            return Err(ImportError::EmptySource {
                format: format.label().to_string(),
            });
        }
    };

    let mut sheet_rows = range.rows();
    let Some(header) = sheet_rows.next() else {
        return Err(ImportError::EmptySource {
            format: format.label().to_string(),
        });
    };
    let columns = header.iter().map(header_text).collect::<Vec<_>>();

    let mut rows = Vec::new();
    for cells in sheet_rows {
        if cells.iter().all(|cell| matches!(cell, Data::Empty)) {
            continue;
        }
        let row = (0..columns.len())
            .map(|idx| cells.get(idx).and_then(spreadsheet_cell))
            .collect::<Vec<_>>();
        rows.push(row);
    }

    Ok(SourceTable {
        format,
        columns,
        rows,
    })
}

fn header_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn spreadsheet_cell(cell: &Data) -> Option<Value> {
    match cell {
        Data::Empty => None,
        Data::String(s) if is_null_token(s) => None,
        Data::String(s) => Some(Value::Text(s.clone())),
        Data::Int(i) => Some(Value::Integer(*i)),
        Data::Float(f) => Some(Value::Float(*f)),
        Data::Bool(b) => Some(Value::Boolean(*b)),
        Data::DateTime(dt) => excel_serial_to_datetime(dt.as_f64()).map(Value::Timestamp),
        Data::DateTimeIso(s) => Some(
            parse_timestamp(s)
                .map(Value::Timestamp)
                .unwrap_or_else(|_| Value::Text(s.clone())),
        ),
        Data::DurationIso(s) => Some(Value::Text(s.clone())),
        Data::Error(err) => {
            debug!("Spreadsheet cell error {err:?} imported as empty");
            None
        }
    }
}

/// Converts a 1900-system Excel serial (days since 1899-12-30) to a timestamp.
fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    base.checked_add_signed(Duration::milliseconds(millis))
}

fn read_json(bytes: &[u8]) -> Result<SourceTable, ImportError> {
    let format = SourceFormat::Json;
    let document: JsonValue = serde_json::from_slice(bytes).map_err(|err| malformed(format, err))?;
    match document {
        JsonValue::Array(records) => json_records(records),
        JsonValue::Object(columns) if columns.values().all(JsonValue::is_array) => {
            let columns = columns
                .into_iter()
                .map(|(name, values)| match values {
                    JsonValue::Array(values) => (name, values),
                    _ => (name, Vec::new()),
                })
                .collect::<Vec<_>>();
            let row_count = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
            let rows = (0..row_count)
                .map(|idx| {
                    columns
                        .iter()
                        .map(|(_, values)| values.get(idx).and_then(json_cell))
                        .collect()
                })
                .collect();
            Ok(SourceTable {
                format,
                columns: columns.into_iter().map(|(name, _)| name).collect(),
                rows,
            })
        }
        _ => Err(malformed(
            format,
            "expected an array of records or an object of column arrays",
        )),
    }
}

fn json_records(records: Vec<JsonValue>) -> Result<SourceTable, ImportError> {
    let format = SourceFormat::Json;
    let mut columns: Vec<String> = Vec::new();
    let mut objects = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        let JsonValue::Object(object) = record else {
            return Err(malformed(format, format!("record {} is not an object", idx + 1)));
        };
        for key in object.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
        objects.push(object);
    }
    let rows = objects
        .iter()
        .map(|object| {
            columns
                .iter()
                .map(|column| object.get(column).and_then(json_cell))
                .collect()
        })
        .collect();
    Ok(SourceTable {
        format,
        columns,
        rows,
    })
}

fn json_cell(value: &JsonValue) -> Option<Value> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(b) => Some(Value::Boolean(*b)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Float)),
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(Value::Text(s.clone())),
        nested => Some(Value::Text(nested.to_string())),
    }
}
