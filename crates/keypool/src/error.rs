//! Error types shared by every keypool component.
//!
//! Failures fall into a small taxonomy:
//! - `StoreUnavailable`: the shared pool store (pool, ledger, yield scalar)
//!   could not be reached or timed out.
//! - `RecordsUnavailable`: a system of record could not be queried.
//! - `SignalUnavailable`: an external input (load or yield) could not be read.
//!   Callers normally substitute a configured default instead of surfacing it.
//! - `InvalidConfig`: a configuration value is out of range.
//! - `Shutdown`: the buffer is shutting down.
//!
//! Running out of keys is *not* an error. See [`crate::Acquire`] and
//! [`crate::RunOutcome`].

use core::future::Future;
use core::time::Duration;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for keypool operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The shared pool store failed or exceeded its round-trip timeout.
    #[error("Pool store unavailable: {context}")]
    StoreUnavailable { context: String },

    /// A system-of-record query failed or exceeded its timeout.
    #[error("System of record unavailable: {context}")]
    RecordsUnavailable { context: String },

    /// An external control signal could not be read.
    #[error("Signal unavailable: {context}")]
    SignalUnavailable { context: String },

    /// A configuration value was rejected.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The buffer has been shut down.
    #[error("Key buffer is shutting down")]
    Shutdown,
}

impl Error {
    pub(crate) fn store(context: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            context: context.into(),
        }
    }

    pub(crate) fn records(context: impl Into<String>) -> Self {
        Self::RecordsUnavailable {
            context: context.into(),
        }
    }

    pub(crate) fn signal(context: impl Into<String>) -> Self {
        Self::SignalUnavailable {
            context: context.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the next scheduled run (or tick) may succeed
    /// without any operator action.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::RecordsUnavailable { .. }
                | Self::SignalUnavailable { .. }
        )
    }
}

/// Runs `fut` with an upper bound on its duration. Expiry is reported through
/// `on_timeout` so each backend maps it onto its own unavailable variant.
pub(crate) async fn bounded<T, F>(
    limit: Duration,
    fut: F,
    on_timeout: impl FnOnce() -> Error,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}
