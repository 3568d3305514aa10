use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in whole seconds since the Unix epoch.
///
/// Ledger scores are issuance timestamps, so the cleanup job and the
/// replenishment task both read time through this trait. Tests substitute a
/// fixed clock.
///
/// # Example
/// ```
/// use keypool::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn unix_seconds(&self) -> u64 {
///         1_700_000_000
///     }
/// }
///
/// assert_eq!(FixedTime.unix_seconds(), 1_700_000_000);
/// ```
pub trait TimeSource {
    /// Returns the current time in seconds since 1970-01-01 UTC.
    fn unix_seconds(&self) -> u64;
}

/// [`TimeSource`] backed by [`SystemTime::now`].
///
/// A clock set before the Unix epoch reads as `0` rather than panicking.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn unix_seconds(&self) -> u64 {
        (**self).unix_seconds()
    }
}
