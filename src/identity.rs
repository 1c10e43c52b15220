//! Identity keys and batch existence resolution.
//!
//! An identity key is a UUID. Keys are validated structurally before the store
//! is touched, canonicalised to lowercase hyphenated form, and resolved for a
//! whole batch with one `id IN (...)` query (split only when the batch exceeds
//! the store's bind-parameter limit).

use std::{collections::HashMap, fmt};

use itertools::Itertools;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    data::{Value, is_null_token},
    schema::ID_COLUMN,
    store::{Store, StoreError, placeholders, quote_ident},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(Uuid);

impl IdentityKey {
    /// Accepts any textual UUID form and trims surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::try_parse(raw.trim()).ok().map(Self)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn to_value(self) -> Value {
        Value::Text(self.to_string())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

/// The identity cell of one source row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityCell {
    Missing,
    Invalid(String),
    Valid(IdentityKey),
}

impl IdentityCell {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None => IdentityCell::Missing,
            Some(value) => {
                let raw = value.as_display();
                if is_null_token(&raw) {
                    IdentityCell::Missing
                } else {
                    IdentityKey::parse(&raw)
                        .map(IdentityCell::Valid)
                        .unwrap_or_else(|| IdentityCell::Invalid(raw.trim().to_string()))
                }
            }
        }
    }

    pub fn key(&self) -> Option<IdentityKey> {
        match self {
            IdentityCell::Valid(key) => Some(*key),
            _ => None,
        }
    }
}

/// The identity column as a comparison operand. Ids written by other tools may
/// be stored in upper or mixed case, so matches ignore case.
pub(crate) fn identity_operand() -> String {
    format!("{} COLLATE NOCASE", quote_ident(ID_COLUMN))
}

/// Batch-scoped: key → exists in the store. Keys whose lookup failed are
/// absent rather than `false`.
pub type MembershipMap = HashMap<IdentityKey, bool>;

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub membership: MembershipMap,
    pub queries: usize,
    pub failed_queries: usize,
}

impl Resolution {
    /// True when every requested key was answered by a bulk query.
    pub fn is_complete(&self) -> bool {
        self.queries > 0 && self.failed_queries == 0
    }
}

pub struct IdentityResolver<'a, S: Store + ?Sized> {
    store: &'a S,
    table: &'a str,
}

impl<'a, S: Store + ?Sized> IdentityResolver<'a, S> {
    pub fn new(store: &'a S, table: &'a str) -> Self {
        Self { store, table }
    }

    pub fn resolve<I>(&self, keys: I) -> Resolution
    where
        I: IntoIterator<Item = IdentityKey>,
    {
        let keys = keys.into_iter().unique().collect::<Vec<_>>();
        let mut resolution = Resolution::default();
        if keys.is_empty() {
            return resolution;
        }
        let chunk_size = self.store.max_parameters().max(1);
        for chunk in keys.chunks(chunk_size) {
            resolution.queries += 1;
            match self.lookup(chunk) {
                Ok(found) => {
                    for key in chunk {
                        resolution.membership.insert(*key, false);
                    }
                    for key in found {
                        resolution.membership.insert(key, true);
                    }
                }
                Err(err) => {
                    error!(
                        "Bulk identity lookup for {} key(s) in '{}' failed: {err}",
                        chunk.len(),
                        self.table
                    );
                    resolution.failed_queries += 1;
                }
            }
        }
        debug!(
            "Resolved {} identity key(s) in {} quer(ies), {} failed",
            keys.len(),
            resolution.queries,
            resolution.failed_queries
        );
        resolution
    }

    fn lookup(&self, keys: &[IdentityKey]) -> Result<Vec<IdentityKey>, StoreError> {
        let sql = format!(
            "SELECT {id} FROM {table} WHERE {operand} IN ({})",
            placeholders(keys.len()),
            id = quote_ident(ID_COLUMN),
            table = quote_ident(self.table),
            operand = identity_operand(),
        );
        let params = keys.iter().map(|key| Some(key.to_value())).collect::<Vec<_>>();
        let rows = self.store.query(&sql, &params)?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get(ID_COLUMN).cloned().flatten())
            .filter_map(|value| IdentityKey::parse(&value.as_display()))
            .collect())
    }

    /// Single-key existence check used when a key is missing from the map.
    pub fn exists(&self, key: IdentityKey) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT 1 AS present FROM {} WHERE {} = ? LIMIT 1",
            quote_ident(self.table),
            identity_operand()
        );
        Ok(!self.store.query(&sql, &[Some(key.to_value())])?.is_empty())
    }
}
