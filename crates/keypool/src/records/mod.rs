//! Systems of record: the permanent tables whose primary keys a generated
//! identifier must never collide with.
//!
//! Tables are described by a static list of [`RecordTable`] descriptors
//! supplied through configuration. A candidate survives only when it is
//! absent from *every* table.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::*;
#[cfg(feature = "postgres")]
pub use postgres::*;

use crate::{CandidateKey, Error, Result};
use async_trait::async_trait;
use core::{fmt, str::FromStr};
use std::collections::HashSet;
use std::sync::Arc;

/// A permanent table and the column holding its identifier.
///
/// Both names are restricted to `[A-Za-z_][A-Za-z0-9_]*` (optionally
/// schema-qualified with a single `.` for the table), because they are
/// interpolated into SQL.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordTable {
    table: String,
    key_column: String,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl RecordTable {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either name is not a plain SQL
    /// identifier.
    pub fn new(table: impl Into<String>, key_column: impl Into<String>) -> Result<Self> {
        let table = table.into();
        let key_column = key_column.into();

        let mut parts = table.split('.');
        let table_ok = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, _) => is_identifier(name),
            (Some(schema), Some(name), None) => is_identifier(schema) && is_identifier(name),
            _ => false,
        };
        if !table_ok {
            return Err(Error::config(format!("invalid record table name `{table}`")));
        }
        if !is_identifier(&key_column) {
            return Err(Error::config(format!(
                "invalid key column `{key_column}` for table `{table}`"
            )));
        }
        Ok(Self { table, key_column })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Parses a comma-separated list of `table:column` descriptors.
    ///
    /// # Example
    /// ```
    /// use keypool::RecordTable;
    ///
    /// let tables = RecordTable::parse_list("note:note_id, customuser:user_id").unwrap();
    /// assert_eq!(tables[1].table(), "customuser");
    /// assert_eq!(tables[1].key_column(), "user_id");
    /// ```
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let tables = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Self>>>()?;
        if tables.is_empty() {
            return Err(Error::config("at least one record table is required"));
        }
        Ok(tables)
    }
}

impl FromStr for RecordTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (table, column) = s.split_once(':').ok_or_else(|| {
            Error::config(format!("record table `{s}` must be written as table:column"))
        })?;
        Self::new(table.trim(), column.trim())
    }
}

impl fmt::Display for RecordTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.key_column)
    }
}

/// Batched absence checks against one system of record.
#[async_trait]
pub trait RecordChecker: Send + Sync {
    /// Returns the subset of `candidates` not present as keys in `table`,
    /// in a single round trip.
    async fn absent_from(
        &self,
        table: &RecordTable,
        candidates: &[CandidateKey],
    ) -> Result<HashSet<CandidateKey>>;
}

#[async_trait]
impl<T: RecordChecker + ?Sized> RecordChecker for Arc<T> {
    async fn absent_from(
        &self,
        table: &RecordTable,
        candidates: &[CandidateKey],
    ) -> Result<HashSet<CandidateKey>> {
        (**self).absent_from(table, candidates).await
    }
}

/// Returns the candidates absent from every table in `tables`, preserving
/// input order.
///
/// Each table is queried with only the candidates that survived the previous
/// tables, and querying stops early once nothing survives.
pub async fn absent_from_all<R: RecordChecker + ?Sized>(
    checker: &R,
    tables: &[RecordTable],
    candidates: Vec<CandidateKey>,
) -> Result<Vec<CandidateKey>> {
    let mut survivors = candidates;
    for table in tables {
        if survivors.is_empty() {
            break;
        }
        let absent = checker.absent_from(table, &survivors).await?;
        survivors.retain(|key| absent.contains(key));
    }
    Ok(survivors)
}
