use crate::{
    Acquire, BufferConfig, CandidateKey, Error, KeyBuffer, MemoryStore, MinKeys, PoolStore,
    ReplenishConfig, ReplenishObserver, ReplenishOutcome,
};
use core::time::Duration;
use std::collections::HashSet;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

async fn seeded(n: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let keys: Vec<CandidateKey> = (0..n).map(|i| CandidateKey::new(format!("k{i:05}"))).collect();
    store.add_available(&keys).await.unwrap();
    store
}

fn config(capacity: usize, batch_size: usize, min_keys: usize) -> BufferConfig {
    BufferConfig {
        capacity,
        replenish: ReplenishConfig {
            batch_size,
            min_keys: MinKeys::Static(min_keys),
            interval: Duration::from_secs(1),
        },
        shutdown_timeout: Duration::from_secs(3),
    }
}

fn drain<S: PoolStore + 'static>(buffer: &KeyBuffer<S>) -> Vec<CandidateKey> {
    let mut keys = Vec::new();
    while let Acquire::Key(key) = buffer.acquire_one() {
        keys.push(key);
    }
    keys
}

#[tokio::test(start_paused = true)]
async fn serves_keys_that_are_already_issued() {
    let store = seeded(100).await;
    let buffer = KeyBuffer::spawn(Arc::clone(&store), config(100, 20, 5)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(buffer.cached(), 20);
    let served = drain(&buffer);
    assert_eq!(served.len(), 20);
    for key in &served {
        assert!(store.issued_at(key).is_some(), "{key} not in ledger");
        assert!(!store.is_available(key));
    }
    assert_eq!(buffer.served(), 20);

    buffer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn refills_on_next_tick() {
    let store = seeded(100).await;
    let buffer = KeyBuffer::spawn(Arc::clone(&store), config(100, 20, 5)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    for _ in 0..16 {
        assert!(!buffer.acquire_one().is_exhausted());
    }
    assert_eq!(buffer.cached(), 4);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(buffer.cached(), 24);
    assert_eq!(store.available_len().await.unwrap(), 60);

    buffer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn empty_pool_reports_exhausted() {
    let store = Arc::new(MemoryStore::new());
    let buffer = KeyBuffer::spawn(Arc::clone(&store), config(10, 5, 5)).unwrap();
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    assert_eq!(buffer.acquire_one(), Acquire::Exhausted);

    // Keys generated later are picked up without a restart.
    store.add_available(&["late".into()]).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(buffer.acquire_one(), Acquire::Key("late".into()));

    buffer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn outage_degrades_to_cached_keys() {
    let store = seeded(50).await;
    let buffer = KeyBuffer::spawn(Arc::clone(&store), config(50, 10, 5)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    for _ in 0..7 {
        assert!(!buffer.acquire_one().is_exhausted());
    }
    store.set_unavailable(true);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(buffer.cached(), 3);
    assert_eq!(drain(&buffer).len(), 3);
    assert!(buffer.acquire_one().is_exhausted());

    store.set_unavailable(false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(buffer.cached(), 10);

    buffer.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sidecars_never_share_keys() {
    let store = seeded(2_000).await;
    let buffers: Vec<_> = (0..4)
        .map(|_| {
            let mut config = config(1_000, 50, 100);
            config.replenish.interval = Duration::from_millis(1);
            KeyBuffer::spawn(Arc::clone(&store), config).unwrap()
        })
        .collect();

    let tasks: Vec<_> = buffers
        .iter()
        .cloned()
        .map(|buffer| {
            tokio::spawn(async move {
                let mut got = Vec::new();
                let mut idle = 0;
                while idle < 50 {
                    match buffer.acquire_one() {
                        Acquire::Key(key) => {
                            idle = 0;
                            got.push(key);
                        }
                        Acquire::Exhausted => {
                            idle += 1;
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                    }
                }
                got
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for task in tasks {
        for key in task.await.unwrap() {
            assert!(seen.insert(key), "key served by two sidecars");
        }
    }
    for buffer in &buffers {
        buffer.shutdown().await.unwrap();
    }

    assert_eq!(seen.len(), 2_000);
    assert_eq!(store.available_len().await.unwrap(), 0);
    assert_eq!(store.issued_len().await.unwrap(), 2_000);
}

#[tokio::test(start_paused = true)]
async fn confirm_persisted_forgets_ledger_entry() {
    let store = seeded(5).await;
    let buffer = KeyBuffer::spawn(Arc::clone(&store), config(10, 5, 5)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let key = buffer.acquire_one().into_key().unwrap();
    assert!(buffer.confirm_persisted(&key).await.unwrap());
    assert_eq!(store.issued_at(&key), None);
    assert!(!buffer.confirm_persisted(&key).await.unwrap());

    buffer.shutdown().await.unwrap();
    assert_eq!(buffer.confirm_persisted(&key).await, Err(Error::Shutdown));
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_idempotent_and_stops_refills() {
    let store = seeded(100).await;
    let buffer = KeyBuffer::spawn(Arc::clone(&store), config(100, 10, 5)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    buffer.shutdown().await.unwrap();
    buffer.shutdown().await.unwrap();

    assert_eq!(drain(&buffer).len(), 10);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(buffer.cached(), 0);
    assert_eq!(store.available_len().await.unwrap(), 90);
}

#[tokio::test(start_paused = true)]
async fn observer_sees_every_tick() {
    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicUsize>, Arc<AtomicUsize>);

    impl ReplenishObserver for Counter {
        fn on_tick(&self, outcome: ReplenishOutcome, _cached: usize, _threshold: usize) {
            self.0.fetch_add(1, Ordering::Relaxed);
            if outcome == ReplenishOutcome::Starved {
                self.1.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    let counter = Counter::default();
    let buffer = KeyBuffer::spawn_with_observer(
        Arc::new(MemoryStore::new()),
        config(10, 5, 5),
        counter.clone(),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    buffer.shutdown().await.unwrap();

    assert_eq!(counter.0.load(Ordering::Relaxed), 3);
    assert_eq!(counter.1.load(Ordering::Relaxed), 3);
}

#[test]
fn rejects_invalid_configs() {
    assert!(config(10, 0, 5).validate().is_err());
    assert!(config(0, 1, 5).validate().is_err());
    assert!(config(10, 20, 5).validate().is_err());
    assert!(BufferConfig::default().validate().is_ok());

    let mut zero_interval = BufferConfig::default();
    zero_interval.replenish.interval = Duration::ZERO;
    assert!(zero_interval.validate().is_err());
}

#[test]
fn spawn_outside_runtime_fails() {
    let err = KeyBuffer::spawn(Arc::new(MemoryStore::new()), BufferConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}
