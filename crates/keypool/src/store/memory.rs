use crate::{CandidateKey, Error, PoolStore, Result, YieldStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Inner {
    available: HashSet<CandidateKey>,
    issued: HashMap<CandidateKey, u64>,
    yield_estimate: Option<f64>,
}

/// An in-process [`PoolStore`] and [`YieldStore`].
///
/// All state sits behind one mutex, so `transfer` is atomic with respect to
/// every other operation. [`MemoryStore::set_unavailable`] makes each call
/// fail with [`Error::StoreUnavailable`], for exercising degradation paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles simulated unavailability.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::store(format!("{op}: memory store marked unavailable")));
        }
        Ok(())
    }

    pub fn is_available(&self, key: &CandidateKey) -> bool {
        self.inner.lock().available.contains(key)
    }

    /// Issuance timestamp of `key`, if it is in the ledger.
    pub fn issued_at(&self, key: &CandidateKey) -> Option<u64> {
        self.inner.lock().issued.get(key).copied()
    }

    /// Records `key` as issued at `issued_at` without touching the pool.
    pub fn insert_issued(&self, key: CandidateKey, issued_at: u64) {
        self.inner.lock().issued.insert(key, issued_at);
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn available_len(&self) -> Result<usize> {
        self.check("available_len")?;
        Ok(self.inner.lock().available.len())
    }

    async fn add_available(&self, keys: &[CandidateKey]) -> Result<usize> {
        self.check("add_available")?;
        let mut inner = self.inner.lock();
        Ok(keys
            .iter()
            .filter(|key| inner.available.insert((*key).clone()))
            .count())
    }

    async fn retain_unissued(&self, mut keys: Vec<CandidateKey>) -> Result<Vec<CandidateKey>> {
        self.check("retain_unissued")?;
        let inner = self.inner.lock();
        keys.retain(|key| !inner.issued.contains_key(key));
        Ok(keys)
    }

    async fn transfer(&self, max: usize, issued_at: u64) -> Result<Vec<CandidateKey>> {
        self.check("transfer")?;
        let mut inner = self.inner.lock();
        let taken: Vec<CandidateKey> = inner.available.iter().take(max).cloned().collect();
        for key in &taken {
            inner.available.remove(key);
            inner.issued.insert(key.clone(), issued_at);
        }
        Ok(taken)
    }

    async fn purge_issued_before(&self, cutoff: u64) -> Result<usize> {
        self.check("purge_issued_before")?;
        let mut inner = self.inner.lock();
        let before = inner.issued.len();
        inner.issued.retain(|_, issued_at| *issued_at >= cutoff);
        Ok(before - inner.issued.len())
    }

    async fn forget_issued(&self, key: &CandidateKey) -> Result<bool> {
        self.check("forget_issued")?;
        Ok(self.inner.lock().issued.remove(key).is_some())
    }

    async fn issued_len(&self) -> Result<usize> {
        self.check("issued_len")?;
        Ok(self.inner.lock().issued.len())
    }
}

#[async_trait]
impl YieldStore for MemoryStore {
    async fn load_yield(&self) -> Result<Option<f64>> {
        self.check("load_yield")?;
        Ok(self.inner.lock().yield_estimate)
    }

    async fn store_yield(&self, value: f64) -> Result<()> {
        self.check("store_yield")?;
        self.inner.lock().yield_estimate = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn keys(n: usize) -> Vec<CandidateKey> {
        (0..n).map(|i| CandidateKey::new(format!("k{i:05}"))).collect()
    }

    #[tokio::test]
    async fn readding_members_is_not_counted() {
        let store = MemoryStore::new();
        assert_eq!(store.add_available(&keys(10)).await.unwrap(), 10);
        assert_eq!(store.add_available(&keys(15)).await.unwrap(), 5);
        assert_eq!(store.available_len().await.unwrap(), 15);
    }

    #[tokio::test]
    async fn transfer_moves_keys_into_ledger() {
        let store = MemoryStore::new();
        store.add_available(&keys(8)).await.unwrap();

        let moved = store.transfer(5, 1_000).await.unwrap();
        assert_eq!(moved.len(), 5);
        assert_eq!(store.available_len().await.unwrap(), 3);
        for key in &moved {
            assert!(!store.is_available(key));
            assert_eq!(store.issued_at(key), Some(1_000));
        }

        let rest = store.transfer(5, 1_001).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(store.transfer(5, 1_002).await.unwrap().is_empty());
        assert_eq!(store.issued_len().await.unwrap(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transfers_are_disjoint() {
        let store = Arc::new(MemoryStore::new());
        store.add_available(&keys(5_000)).await.unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    loop {
                        let batch = store.transfer(7, 1).await.unwrap();
                        if batch.is_empty() {
                            break received;
                        }
                        received.extend(batch);
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for key in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(key), "key delivered twice");
            }
        }
        assert_eq!(total, 5_000);
    }

    #[tokio::test]
    async fn retain_unissued_filters_ledger_members() {
        let store = MemoryStore::new();
        store.insert_issued(CandidateKey::from("k00001"), 10);
        let kept = store.retain_unissued(keys(3)).await.unwrap();
        assert_eq!(kept, vec![CandidateKey::from("k00000"), CandidateKey::from("k00002")]);
    }

    #[tokio::test]
    async fn purge_is_strictly_before_cutoff() {
        let store = MemoryStore::new();
        store.insert_issued("old".into(), 99);
        store.insert_issued("edge".into(), 100);
        store.insert_issued("new".into(), 101);
        assert_eq!(store.purge_issued_before(100).await.unwrap(), 1);
        assert_eq!(store.issued_at(&"edge".into()), Some(100));
        assert_eq!(store.purge_issued_before(100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn forget_removes_single_entry() {
        let store = MemoryStore::new();
        store.insert_issued("done".into(), 5);
        assert!(store.forget_issued(&"done".into()).await.unwrap());
        assert!(!store.forget_issued(&"done".into()).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.transfer(1, 0).await,
            Err(Error::StoreUnavailable { .. })
        ));
        assert!(store.available_len().await.is_err());
        store.set_unavailable(false);
        assert_eq!(store.available_len().await.unwrap(), 0);
    }
}
