use crate::{PoolStore, Result, SystemClock, TimeSource};
use core::time::Duration;

/// Result of one ledger cleanup pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupReport {
    /// Entries issued strictly before this Unix timestamp were purged.
    pub cutoff: u64,
    pub removed: usize,
}

/// Purges issued-ledger entries older than a retention window.
///
/// An identifier that was handed out but never persisted stays in the ledger
/// until it ages out here. Once removed it is, in principle, eligible to be
/// generated again. Runs are idempotent: a second run with the same `now`
/// removes nothing.
///
/// # Example
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> keypool::Result<()> {
/// use core::time::Duration;
/// use keypool::{CleanupJob, MemoryStore};
/// use std::sync::Arc;
///
/// let store = Arc::new(MemoryStore::new());
/// store.insert_issued("stale".into(), 1_000);
/// store.insert_issued("fresh".into(), 1_900);
///
/// let job = CleanupJob::new(Arc::clone(&store), Duration::from_secs(15 * 60));
/// let report = job.run_at(2_000).await?;
/// assert_eq!(report.cutoff, 1_100);
/// assert_eq!(report.removed, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct CleanupJob<P, C = SystemClock> {
    store: P,
    retention: Duration,
    clock: C,
}

impl<P: PoolStore> CleanupJob<P> {
    pub const fn new(store: P, retention: Duration) -> Self {
        Self::with_clock(store, retention, SystemClock)
    }
}

impl<P: PoolStore, C: TimeSource> CleanupJob<P, C> {
    pub const fn with_clock(store: P, retention: Duration, clock: C) -> Self {
        Self {
            store,
            retention,
            clock,
        }
    }

    pub const fn retention(&self) -> Duration {
        self.retention
    }

    /// Purges entries older than the retention window, measured from the
    /// job's clock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StoreUnavailable`] if the range delete fails.
    /// Nothing is retried within the run.
    pub async fn run(&self) -> Result<CleanupReport> {
        self.run_at(self.clock.unix_seconds()).await
    }

    /// Purges entries issued strictly before `now - retention`.
    ///
    /// # Errors
    ///
    /// See [`CleanupJob::run`].
    pub async fn run_at(&self, now: u64) -> Result<CleanupReport> {
        let cutoff = now.saturating_sub(self.retention.as_secs());
        let removed = self.store.purge_issued_before(cutoff).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(cutoff, removed, "Purged expired ledger entries");

        Ok(CleanupReport { cutoff, removed })
    }
}
