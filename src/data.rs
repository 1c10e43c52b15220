//! Cell values and best-effort typing for imported tables.
//!
//! Source adapters hand every cell over as raw text (delimited files) or as an
//! already-typed scalar (spreadsheets, JSON). [`ColumnTyping`] samples a whole
//! column and picks the narrowest type every non-empty cell satisfies, after
//! which [`parse_cell`] converts raw text into a [`Value`]. A cell that does not
//! fit stays text rather than failing the import.

use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    (*f as i64).to_string()
                } else {
                    f.to_string()
                }
            }
            Value::Boolean(b) => b.to_string(),
            Value::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

/// The type a source column settles on after sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone)]
pub struct ColumnTyping {
    possible_integer: bool,
    possible_float: bool,
    possible_boolean: bool,
    possible_timestamp: bool,
    observed: usize,
}

impl Default for ColumnTyping {
    fn default() -> Self {
        Self {
            possible_integer: true,
            possible_float: true,
            possible_boolean: true,
            possible_timestamp: true,
            observed: 0,
        }
    }
}

impl ColumnTyping {
    pub fn observe(&mut self, raw: &str) {
        let value = raw.trim();
        if is_null_token(value) {
            return;
        }
        self.observed += 1;
        if self.possible_boolean && parse_boolean(value).is_none() {
            self.possible_boolean = false;
        }
        let zero_padded = has_leading_zero(value);
        if self.possible_integer && (zero_padded || value.parse::<i64>().is_err()) {
            self.possible_integer = false;
        }
        if self.possible_float
            && (zero_padded || value.parse::<f64>().map_or(true, |f| !f.is_finite()))
        {
            self.possible_float = false;
        }
        if self.possible_timestamp && parse_timestamp(value).is_err() {
            self.possible_timestamp = false;
        }
    }

    pub fn decide(&self) -> CellType {
        if self.observed == 0 {
            CellType::Text
        } else if self.possible_boolean {
            CellType::Boolean
        } else if self.possible_integer {
            CellType::Integer
        } else if self.possible_float {
            CellType::Float
        } else if self.possible_timestamp {
            CellType::Timestamp
        } else {
            CellType::Text
        }
    }
}

// Leading zeros ("007", "0123") are codes, not numbers.
fn has_leading_zero(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    let mut chars = digits.chars();
    chars.next() == Some('0') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn parse_boolean(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

pub fn parse_naive_date(value: &str) -> Result<NaiveDate> {
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as date"))
}

pub fn parse_naive_datetime(value: &str) -> Result<NaiveDateTime> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as datetime"))
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    parse_naive_datetime(value).or_else(|_| {
        parse_naive_date(value)?
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("Failed to parse '{value}' as timestamp"))
    })
}

/// Converts a raw cell into a typed value. Empty cells become `None`; cells
/// that do not satisfy `ty` fall back to text.
pub fn parse_cell(raw: &str, ty: CellType) -> Option<Value> {
    let trimmed = raw.trim();
    if is_null_token(trimmed) {
        return None;
    }
    let typed = match ty {
        CellType::Text => None,
        CellType::Integer => trimmed.parse().ok().map(Value::Integer),
        CellType::Float => trimmed.parse().ok().map(Value::Float),
        CellType::Boolean => parse_boolean(trimmed).map(Value::Boolean),
        CellType::Timestamp => parse_timestamp(trimmed).ok().map(Value::Timestamp),
    };
    Some(typed.unwrap_or_else(|| Value::Text(raw.to_string())))
}

/// Tokens that spreadsheet and dataframe exports write for a missing value.
pub fn is_null_token(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "nan" | "none" | "null" | "na"
    )
}

pub fn normalize_column_name(name: &str) -> String {
    let mut normalized = name
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect::<String>()
        .to_ascii_lowercase();
    if normalized.is_empty() || normalized.starts_with(|c: char| c.is_ascii_digit()) {
        normalized.insert(0, '_');
    }
    normalized
}
