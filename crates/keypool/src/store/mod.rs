//! The shared pool store: the available pool, the issued ledger and the
//! persisted yield scalar.
//!
//! Every mutation goes through one of the primitives below (add, atomic
//! pop-and-stamp, range delete, single delete). No caller reads the pool and
//! then writes it back; [`PoolStore::transfer`] is the only operation that
//! needs cross-process mutual exclusion, and implementations must execute it
//! as one indivisible step on the store side.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::*;
#[cfg(feature = "redis")]
pub use self::redis::*;

use crate::{CandidateKey, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Shared storage for the available pool and the issued ledger.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Number of keys in the available pool.
    async fn available_len(&self) -> Result<usize>;

    /// Adds `keys` to the available pool and returns how many were not
    /// already members.
    async fn add_available(&self, keys: &[CandidateKey]) -> Result<usize>;

    /// Returns the subset of `keys` that is absent from the issued ledger,
    /// preserving input order. Executed as one batched round trip.
    async fn retain_unissued(&self, keys: Vec<CandidateKey>) -> Result<Vec<CandidateKey>>;

    /// Atomically removes up to `max` arbitrary members from the available
    /// pool and records each in the issued ledger with score `issued_at`.
    ///
    /// Either every returned key was moved or nothing happened. Two
    /// concurrent callers never receive the same key.
    async fn transfer(&self, max: usize, issued_at: u64) -> Result<Vec<CandidateKey>>;

    /// Removes every ledger entry issued strictly before `cutoff` and returns
    /// the number removed.
    async fn purge_issued_before(&self, cutoff: u64) -> Result<usize>;

    /// Removes `key` from the issued ledger once it has been persisted to a
    /// system of record. Returns `false` if it was not present.
    async fn forget_issued(&self, key: &CandidateKey) -> Result<bool>;

    /// Number of entries in the issued ledger.
    async fn issued_len(&self) -> Result<usize>;
}

/// Durable storage for the generator's smoothed yield estimate.
///
/// Concurrent generator runs may race on this value. It is a control signal,
/// not a correctness-critical one.
#[async_trait]
pub trait YieldStore: Send + Sync {
    async fn load_yield(&self) -> Result<Option<f64>>;

    async fn store_yield(&self, value: f64) -> Result<()>;
}

#[async_trait]
impl<T: PoolStore + ?Sized> PoolStore for Arc<T> {
    async fn available_len(&self) -> Result<usize> {
        (**self).available_len().await
    }

    async fn add_available(&self, keys: &[CandidateKey]) -> Result<usize> {
        (**self).add_available(keys).await
    }

    async fn retain_unissued(&self, keys: Vec<CandidateKey>) -> Result<Vec<CandidateKey>> {
        (**self).retain_unissued(keys).await
    }

    async fn transfer(&self, max: usize, issued_at: u64) -> Result<Vec<CandidateKey>> {
        (**self).transfer(max, issued_at).await
    }

    async fn purge_issued_before(&self, cutoff: u64) -> Result<usize> {
        (**self).purge_issued_before(cutoff).await
    }

    async fn forget_issued(&self, key: &CandidateKey) -> Result<bool> {
        (**self).forget_issued(key).await
    }

    async fn issued_len(&self) -> Result<usize> {
        (**self).issued_len().await
    }
}

#[async_trait]
impl<T: YieldStore + ?Sized> YieldStore for Arc<T> {
    async fn load_yield(&self) -> Result<Option<f64>> {
        (**self).load_yield().await
    }

    async fn store_yield(&self, value: f64) -> Result<()> {
        (**self).store_yield(value).await
    }
}
