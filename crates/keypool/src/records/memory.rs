use crate::{CandidateKey, Error, RecordChecker, RecordTable, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-process systems of record, keyed by table name.
#[derive(Debug, Default)]
pub struct MemoryRecords {
    tables: RwLock<HashMap<String, HashSet<CandidateKey>>>,
    queries: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists `key` as a row of `table`.
    pub fn insert(&self, table: &RecordTable, key: CandidateKey) {
        self.tables
            .write()
            .entry(table.table().to_owned())
            .or_default()
            .insert(key);
    }

    /// Number of `absent_from` round trips served so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }
}

#[async_trait]
impl RecordChecker for MemoryRecords {
    async fn absent_from(
        &self,
        table: &RecordTable,
        candidates: &[CandidateKey],
    ) -> Result<HashSet<CandidateKey>> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::records(format!("{}: marked unavailable", table.table())));
        }
        self.queries.fetch_add(1, Ordering::Relaxed);

        let tables = self.tables.read();
        let rows = tables.get(table.table());
        Ok(candidates
            .iter()
            .filter(|key| rows.is_none_or(|rows| !rows.contains(*key)))
            .cloned()
            .collect())
    }
}
