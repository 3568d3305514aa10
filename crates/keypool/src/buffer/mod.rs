//! The buffer sidecar: a per-process cache of already-issued keys.
//!
//! A [`KeyBuffer`] owns a [`LocalCache`] and a background [`Replenisher`].
//! Callers take keys with [`KeyBuffer::acquire_one`], which never blocks and
//! never touches the shared store. The replenisher refills the cache through
//! the store's atomic transfer whenever it drops below its threshold.

mod cache;
mod replenish;
mod threshold;

#[cfg(test)]
mod tests;

pub use cache::*;
pub use replenish::*;
pub use threshold::*;

use crate::{CandidateKey, Error, PoolStore, Result, SystemClock};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::{runtime::Handle, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// Configuration for a [`KeyBuffer`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BufferConfig {
    /// Maximum number of keys held locally.
    pub capacity: usize,
    pub replenish: ReplenishConfig,
    /// How long [`KeyBuffer::shutdown`] waits for the replenisher to stop.
    pub shutdown_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            replenish: ReplenishConfig::default(),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl BufferConfig {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the batch size or capacity is zero,
    /// if a full batch would not fit the cache, or if the interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.replenish.batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }
        if self.capacity == 0 {
            return Err(Error::config("cache capacity must be at least 1"));
        }
        if self.capacity < self.replenish.batch_size {
            return Err(Error::config(format!(
                "cache capacity {} is smaller than batch size {}",
                self.capacity, self.replenish.batch_size
            )));
        }
        if self.replenish.interval.is_zero() {
            return Err(Error::config("replenish interval must be non-zero"));
        }
        Ok(())
    }
}

/// Handle to a running buffer. Clones share the cache and the background
/// task.
pub struct KeyBuffer<S> {
    cache: LocalCache,
    store: Arc<S>,
    threshold: Arc<AtomicUsize>,
    shutdown_token: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_timeout: Duration,
}

impl<S> Clone for KeyBuffer<S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            store: Arc::clone(&self.store),
            threshold: Arc::clone(&self.threshold),
            shutdown_token: self.shutdown_token.clone(),
            task: Arc::clone(&self.task),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

impl<S: PoolStore + 'static> KeyBuffer<S> {
    /// Validates `config` and starts the replenishment loop on the current
    /// Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a rejected configuration or when
    /// called outside a Tokio runtime.
    pub fn spawn(store: Arc<S>, config: BufferConfig) -> Result<Self> {
        Self::spawn_with_observer(store, config, ())
    }

    /// Like [`KeyBuffer::spawn`], reporting every tick to `observer`.
    ///
    /// # Errors
    ///
    /// See [`KeyBuffer::spawn`].
    pub fn spawn_with_observer<O>(store: Arc<S>, config: BufferConfig, observer: O) -> Result<Self>
    where
        O: ReplenishObserver + 'static,
    {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::config(format!("key buffer needs a Tokio runtime: {e}")))?;

        let cache = LocalCache::with_capacity(config.capacity);
        let replenisher = Replenisher::with_parts(
            Arc::clone(&store),
            cache.clone(),
            config.replenish,
            SystemClock,
            observer,
        );
        let threshold = replenisher.threshold_handle();
        let shutdown_token = CancellationToken::new();
        let task = runtime.spawn(replenisher.run(shutdown_token.child_token()));

        #[cfg(feature = "tracing")]
        tracing::info!(
            capacity = config.capacity,
            batch_size = config.replenish.batch_size,
            "Key buffer started"
        );

        Ok(Self {
            cache,
            store,
            threshold,
            shutdown_token,
            task: Arc::new(Mutex::new(Some(task))),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Takes one key from the local cache.
    ///
    /// The returned key is already in the issued ledger. Returns
    /// [`Acquire::Exhausted`] immediately when the cache is empty.
    pub fn acquire_one(&self) -> Acquire {
        self.cache.acquire_one()
    }

    /// Keys currently cached.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Threshold computed on the most recent tick.
    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Total keys served by this buffer.
    pub fn served(&self) -> u64 {
        self.cache.served()
    }

    /// Drops `key` from the issued ledger after the caller has committed it
    /// to a system of record. Returns `false` if the ledger no longer held
    /// it (for example because cleanup already purged it).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] after [`KeyBuffer::shutdown`], or
    /// [`Error::StoreUnavailable`] if the store cannot be reached. In the
    /// latter case the entry simply ages out.
    pub async fn confirm_persisted(&self, key: &CandidateKey) -> Result<bool> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::Shutdown);
        }
        self.store.forget_issued(key).await
    }

    /// Stops the replenishment loop, waiting up to the configured shutdown
    /// timeout. Cached keys are abandoned and age out of the ledger.
    ///
    /// Idempotent; later calls return immediately.
    ///
    /// # Errors
    ///
    /// Currently infallible. A loop that fails to stop in time is aborted
    /// and logged.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_token.cancel();
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        #[cfg(feature = "tracing")]
        tracing::info!(cached = self.cache.len(), "Stopping key buffer");

        let abort = task.abort_handle();
        match timeout(self.shutdown_timeout, task).await {
            Ok(Ok(())) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Replenishment loop joined");
            }
            Ok(Err(_e)) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_e, "Replenishment loop failed");
            }
            Err(_) => {
                abort.abort();
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Replenishment loop did not stop in time, aborted"
                );
            }
        }

        Ok(())
    }
}
