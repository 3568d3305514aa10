//! External control inputs for the generator: the load signal `L` and the
//! persisted yield estimate `y`.
//!
//! Both inputs degrade to configured defaults on any failure. The
//! substitution is visible to the caller through [`Signal::Defaulted`].

#[cfg(feature = "prometheus")]
mod prometheus;

#[cfg(feature = "prometheus")]
pub use prometheus::*;

use crate::{Result, YieldEstimate, YieldStore};
use async_trait::async_trait;
use core::time::Duration;

/// A control input together with where it came from.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal<T> {
    /// Read from its source.
    Observed(T),
    /// The source failed; `value` is the configured default.
    Defaulted { value: T, reason: String },
}

impl<T: Copy> Signal<T> {
    pub fn value(&self) -> T {
        match self {
            Self::Observed(value) | Self::Defaulted { value, .. } => *value,
        }
    }
}

impl<T> Signal<T> {
    pub const fn is_defaulted(&self) -> bool {
        matches!(self, Self::Defaulted { .. })
    }
}

/// A source for the rate of identifier-consuming operations.
#[async_trait]
pub trait LoadSource: Send + Sync {
    /// Returns identifiers consumed per second, averaged over `window`.
    async fn current_rate(&self, window: Duration) -> Result<f64>;
}

/// A [`LoadSource`] with a fixed rate. Used when no metrics backend is
/// configured.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StaticLoad(pub f64);

#[async_trait]
impl LoadSource for StaticLoad {
    async fn current_rate(&self, _window: Duration) -> Result<f64> {
        Ok(self.0)
    }
}

/// Fallback values for unreadable signals.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignalDefaults {
    pub load: f64,
    pub yield_estimate: f64,
    pub window: Duration,
}

impl Default for SignalDefaults {
    fn default() -> Self {
        Self {
            load: 10.0,
            yield_estimate: 0.9,
            window: Duration::from_secs(300),
        }
    }
}

/// Reads the load signal, substituting `defaults.load` on failure or on a
/// negative/non-finite reading.
pub async fn read_load<L: LoadSource + ?Sized>(source: &L, defaults: &SignalDefaults) -> Signal<f64> {
    let reason = match source.current_rate(defaults.window).await {
        Ok(rate) if rate.is_finite() && rate >= 0.0 => return Signal::Observed(rate),
        Ok(rate) => format!("load source returned unusable rate {rate}"),
        Err(e) => e.to_string(),
    };

    #[cfg(feature = "tracing")]
    tracing::warn!(default = defaults.load, %reason, "Load signal unavailable, using default");

    Signal::Defaulted {
        value: defaults.load,
        reason,
    }
}

/// Reads the persisted yield estimate, substituting
/// `defaults.yield_estimate` when it is missing or unreadable.
pub async fn read_yield<Y: YieldStore + ?Sized>(
    store: &Y,
    defaults: &SignalDefaults,
) -> Signal<YieldEstimate> {
    let reason = match store.load_yield().await {
        Ok(Some(value)) if value.is_finite() && value > 0.0 => {
            return Signal::Observed(YieldEstimate::new(value));
        }
        Ok(Some(value)) => format!("stored yield estimate {value} is out of range"),
        Ok(None) => "no yield estimate stored yet".to_owned(),
        Err(e) => e.to_string(),
    };

    #[cfg(feature = "tracing")]
    tracing::warn!(
        default = defaults.yield_estimate,
        %reason,
        "Yield estimate unavailable, using default"
    );

    Signal::Defaulted {
        value: YieldEstimate::new(defaults.yield_estimate),
        reason,
    }
}
