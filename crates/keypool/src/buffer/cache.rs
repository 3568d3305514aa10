use crate::CandidateKey;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Outcome of [`LocalCache::acquire_one`].
///
/// `Exhausted` is a capacity signal, not a failure: the caller is expected to
/// back off and retry, or fail its own operation visibly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// A key that is already recorded in the issued ledger.
    Key(CandidateKey),
    /// The local cache is empty.
    Exhausted,
}

impl Acquire {
    pub fn into_key(self) -> Option<CandidateKey> {
        match self {
            Self::Key(key) => Some(key),
            Self::Exhausted => None,
        }
    }

    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

/// A bounded, lock-free FIFO of keys owned by this process.
///
/// Every key in the cache has already been moved into the issued ledger by a
/// transfer, so the cache may be dropped at any time without compromising
/// uniqueness. Lost keys simply age out of the ledger.
///
/// Clones share the same queue.
#[derive(Clone, Debug)]
pub struct LocalCache {
    tx: Sender<CandidateKey>,
    rx: Receiver<CandidateKey>,
    capacity: usize,
    served: Arc<AtomicU64>,
}

impl LocalCache {
    /// Creates a cache holding at most `capacity` keys. A zero capacity is
    /// raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            served: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room left before the cache is full.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Appends `key`, handing it back if the cache is full.
    ///
    /// # Errors
    ///
    /// Returns the key when no slot is free.
    pub fn push(&self, key: CandidateKey) -> Result<(), CandidateKey> {
        match self.tx.try_send(key) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(key) | TrySendError::Disconnected(key)) => Err(key),
        }
    }

    /// Appends keys in order until the cache fills up. Returns the number
    /// appended; the rest are dropped.
    pub fn extend<I: IntoIterator<Item = CandidateKey>>(&self, keys: I) -> usize {
        let mut pushed = 0;
        for key in keys {
            if self.push(key).is_err() {
                break;
            }
            pushed += 1;
        }
        pushed
    }

    /// Pops the oldest key without blocking.
    pub fn acquire_one(&self) -> Acquire {
        match self.rx.try_recv() {
            Ok(key) => {
                self.served.fetch_add(1, Ordering::Relaxed);
                Acquire::Key(key)
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Acquire::Exhausted,
        }
    }

    /// Total keys handed out since creation.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn keys(range: core::ops::Range<usize>) -> Vec<CandidateKey> {
        range.map(|i| CandidateKey::new(format!("k{i}"))).collect()
    }

    #[test]
    fn serves_in_fifo_order() {
        let cache = LocalCache::with_capacity(8);
        assert_eq!(cache.extend(keys(0..3)), 3);

        assert_eq!(cache.acquire_one(), Acquire::Key("k0".into()));
        assert_eq!(cache.acquire_one(), Acquire::Key("k1".into()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.served(), 2);
    }

    #[test]
    fn empty_cache_reports_exhausted() {
        let cache = LocalCache::with_capacity(4);
        assert!(cache.acquire_one().is_exhausted());
        assert_eq!(cache.served(), 0);
    }

    #[test]
    fn full_cache_rejects_push() {
        let cache = LocalCache::with_capacity(2);
        assert_eq!(cache.extend(keys(0..5)), 2);
        assert_eq!(cache.free(), 0);
        assert_eq!(cache.push("late".into()), Err(CandidateKey::from("late")));
    }

    #[test]
    fn concurrent_consumers_never_share_a_key() {
        let cache = LocalCache::with_capacity(4_000);
        cache.extend(keys(0..4_000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Acquire::Key(key) = cache.acquire_one() {
                        got.push(key);
                    }
                    got
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(seen.insert(key), "key served twice");
            }
        }
        assert_eq!(seen.len(), 4_000);
        assert_eq!(cache.served(), 4_000);
    }
}
