use crate::{LocalCache, MinKeys, PoolStore, SystemClock, TimeSource};
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Tuning for the background replenishment loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReplenishConfig {
    /// Upper bound on keys moved per transfer.
    pub batch_size: usize,
    /// When the cache holds fewer keys than this, a transfer is issued.
    pub min_keys: MinKeys,
    /// Delay between ticks.
    pub interval: Duration,
}

impl Default for ReplenishConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            min_keys: MinKeys::default(),
            interval: Duration::from_secs(1),
        }
    }
}

/// What a single replenishment tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplenishOutcome {
    /// The cache was at or above its threshold.
    Sufficient,
    /// This many keys were moved from the pool into the cache.
    Transferred(usize),
    /// The shared pool was empty.
    Starved,
    /// The transfer failed. The cache keeps serving what it holds.
    StoreUnavailable,
}

/// Hook for recording replenishment activity, e.g. as metrics.
pub trait ReplenishObserver: Send + Sync {
    fn on_tick(&self, outcome: ReplenishOutcome, cached: usize, threshold: usize);
}

impl ReplenishObserver for () {
    fn on_tick(&self, _outcome: ReplenishOutcome, _cached: usize, _threshold: usize) {}
}

/// Keeps a [`LocalCache`] topped up from the shared pool.
///
/// The serve rate measured between ticks is the load fed to
/// [`MinKeys::threshold`]. Every transfer is atomic on the store side, so any
/// number of replenishers (one per process) may share one pool.
pub struct Replenisher<S, C = SystemClock, O = ()> {
    store: Arc<S>,
    cache: LocalCache,
    config: ReplenishConfig,
    clock: C,
    observer: O,
    threshold: Arc<AtomicUsize>,
    last_served: u64,
    last_tick: Option<Instant>,
}

impl<S: PoolStore> Replenisher<S> {
    pub fn new(store: Arc<S>, cache: LocalCache, config: ReplenishConfig) -> Self {
        Self::with_parts(store, cache, config, SystemClock, ())
    }
}

impl<S, C, O> Replenisher<S, C, O>
where
    S: PoolStore,
    C: TimeSource,
    O: ReplenishObserver,
{
    pub fn with_parts(
        store: Arc<S>,
        cache: LocalCache,
        config: ReplenishConfig,
        clock: C,
        observer: O,
    ) -> Self {
        let threshold = config.min_keys.capped(0.0, cache.capacity());
        Self {
            store,
            cache,
            config,
            clock,
            observer,
            threshold: Arc::new(AtomicUsize::new(threshold)),
            last_served: 0,
            last_tick: None,
        }
    }

    /// Most recent threshold, shared with readers outside the loop.
    pub fn threshold_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.threshold)
    }

    /// Keys served per second since the previous call.
    fn measure_load(&mut self) -> f64 {
        let now = Instant::now();
        let served = self.cache.served();
        let load = match self.last_tick {
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs_f64();
                if elapsed > 0.0 {
                    served.saturating_sub(self.last_served) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_tick = Some(now);
        self.last_served = served;
        load
    }

    /// Runs one check-and-transfer step.
    pub async fn tick(&mut self) -> ReplenishOutcome {
        let load = self.measure_load();
        let threshold = self.config.min_keys.capped(load, self.cache.capacity());
        self.threshold.store(threshold, Ordering::Relaxed);

        let outcome = self.replenish(threshold).await;
        self.observer.on_tick(outcome, self.cache.len(), threshold);
        outcome
    }

    async fn replenish(&self, threshold: usize) -> ReplenishOutcome {
        let cached = self.cache.len();
        if cached >= threshold {
            return ReplenishOutcome::Sufficient;
        }

        let max = self.config.batch_size.min(self.cache.free());
        if max == 0 {
            return ReplenishOutcome::Sufficient;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(cached, threshold, max, "Cache below threshold, transferring");

        let keys = match self.store.transfer(max, self.clock.unix_seconds()).await {
            Ok(keys) => keys,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_e, cached, "Transfer failed, serving from cache");
                return ReplenishOutcome::StoreUnavailable;
            }
        };

        if keys.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::warn!(cached, "Shared pool returned no keys");
            return ReplenishOutcome::Starved;
        }

        let received = keys.len();
        let pushed = self.cache.extend(keys);
        if pushed < received {
            // Only reachable if something else fills the same cache. The
            // dropped keys are already in the ledger and will age out.
            #[cfg(feature = "tracing")]
            tracing::warn!(received, pushed, "Cache full, dropped transferred keys");
        }

        #[cfg(feature = "tracing")]
        tracing::info!(transferred = pushed, cached = self.cache.len(), "Cache replenished");

        ReplenishOutcome::Transferred(pushed)
    }

    /// Ticks on a fixed interval until `shutdown` is cancelled. The first
    /// tick fires immediately.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        #[cfg(feature = "tracing")]
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Replenishment loop started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(cached = self.cache.len(), "Replenishment loop stopped");
    }
}
