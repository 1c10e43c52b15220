//! Row classification.
//!
//! Each source row is tagged exactly once as insert, update or drop. The
//! decision depends only on the row's identity cell and the batch membership
//! map; a key the map cannot answer is checked individually through the
//! caller-supplied fallback. Rows that survive have their payload screened by
//! the [`Sanitizer`]; rejected cells are left out of the write.

use std::fmt;

use log::debug;

use crate::{
    data::Value,
    error::RowProcessingError,
    identity::{IdentityCell, IdentityKey, MembershipMap},
    report::DroppedRow,
    sanitize::Sanitizer,
    store::StoreError,
};

/// Column name and value pairs in source column order. Null cells are absent.
pub type Payload = Vec<(String, Value)>;

/// A row headed for the bulk writer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRow {
    /// 1-based position among the source's data rows.
    pub row: usize,
    pub key: IdentityKey,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    InvalidIdentityFormat,
    IdentityNotFound,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::InvalidIdentityFormat => "invalid identity format",
            DropReason::IdentityNotFound => "UUID not found in database",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Insert,
    Update(IdentityKey),
    Drop(DropReason),
}

pub fn decide<F>(
    cell: &IdentityCell,
    membership: &MembershipMap,
    exists: F,
) -> Result<Decision, StoreError>
where
    F: FnOnce(IdentityKey) -> Result<bool, StoreError>,
{
    let key = match cell {
        IdentityCell::Missing => return Ok(Decision::Insert),
        IdentityCell::Invalid(_) => {
            return Ok(Decision::Drop(DropReason::InvalidIdentityFormat));
        }
        IdentityCell::Valid(key) => *key,
    };
    let found = match membership.get(&key) {
        Some(found) => *found,
        None => exists(key)?,
    };
    Ok(if found {
        Decision::Update(key)
    } else {
        Decision::Drop(DropReason::IdentityNotFound)
    })
}

/// A source column that feeds the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataColumn {
    pub index: usize,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct Classification {
    pub inserts: Vec<PendingRow>,
    pub updates: Vec<PendingRow>,
    pub dropped: Vec<DroppedRow>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub fallback_lookups: usize,
}

pub struct RowClassifier<'a> {
    sanitizer: &'a Sanitizer,
    columns: &'a [DataColumn],
    identity_index: Option<usize>,
}

impl<'a> RowClassifier<'a> {
    pub fn new(
        sanitizer: &'a Sanitizer,
        columns: &'a [DataColumn],
        identity_index: Option<usize>,
    ) -> Self {
        Self {
            sanitizer,
            columns,
            identity_index,
        }
    }

    pub fn identity_cells(&self, rows: &[Vec<Option<Value>>]) -> Vec<IdentityCell> {
        rows.iter()
            .map(|row| match self.identity_index {
                Some(idx) => IdentityCell::from_value(row.get(idx).and_then(Option::as_ref)),
                None => IdentityCell::Missing,
            })
            .collect()
    }

    pub fn classify<F>(
        &self,
        rows: &[Vec<Option<Value>>],
        cells: &[IdentityCell],
        membership: &MembershipMap,
        mut exists: F,
    ) -> Classification
    where
        F: FnMut(IdentityKey) -> Result<bool, StoreError>,
    {
        let mut out = Classification::default();
        for (idx, (row, cell)) in rows.iter().zip(cells).enumerate() {
            let number = idx + 1;
            let decision = decide(cell, membership, |key| {
                out.fallback_lookups += 1;
                exists(key)
            });
            let decision = match decision {
                Ok(decision) => decision,
                Err(source) => {
                    let err = RowProcessingError {
                        row: number,
                        source,
                    };
                    debug!("{err}");
                    out.errors.push(err.to_string());
                    continue;
                }
            };
            let key = match decision {
                Decision::Drop(reason) => {
                    let identity = self.raw_identity(row);
                    out.warnings.push(match reason {
                        DropReason::InvalidIdentityFormat => {
                            format!("Row {number}: invalid identity format '{identity}', dropped")
                        }
                        DropReason::IdentityNotFound => {
                            format!("Row {number}: UUID not found in database, dropped")
                        }
                    });
                    out.dropped.push(DroppedRow {
                        row: number,
                        identity,
                        reason: reason.to_string(),
                    });
                    continue;
                }
                Decision::Insert => None,
                Decision::Update(key) => Some(key),
            };
            let payload = self.payload(number, row, &mut out.warnings);
            if payload.is_empty() {
                out.warnings
                    .push(format!("Row {number}: No valid data to insert/update"));
                continue;
            }
            match key {
                Some(key) => out.updates.push(PendingRow {
                    row: number,
                    key,
                    payload,
                }),
                None => out.inserts.push(PendingRow {
                    row: number,
                    key: IdentityKey::generate(),
                    payload,
                }),
            }
        }
        out
    }

    /// The identity cell as the caller wrote it, trimmed.
    fn raw_identity(&self, row: &[Option<Value>]) -> String {
        self.identity_index
            .and_then(|idx| row.get(idx))
            .and_then(Option::as_ref)
            .map(|value| value.as_display().trim().to_string())
            .unwrap_or_default()
    }

    fn payload(&self, number: usize, row: &[Option<Value>], warnings: &mut Vec<String>) -> Payload {
        let mut payload = Payload::with_capacity(self.columns.len());
        for column in self.columns {
            let Some(value) = row.get(column.index).and_then(Option::as_ref) else {
                continue;
            };
            match self.sanitizer.check(&column.name, &value.as_display()) {
                Ok(()) => payload.push((column.name.clone(), value.clone())),
                Err(rejection) => warnings.push(format!(
                    "Row {number}: value for '{}' rejected by sanitizer ({rejection}), column skipped",
                    column.name
                )),
            }
        }
        payload
    }
}
