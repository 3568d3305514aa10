//! Feedback control for batch sizing.
//!
//! The generator keeps the available pool sized to cover `T` seconds of
//! demand at the observed load `L`. Only a fraction `y` of freshly minted
//! candidates survive verification, so the raw batch is inflated by `1/y`.
//! `y` is a smoothed estimate that never falls below a configured floor, which
//! keeps `Y = ceil(G / y)` bounded when a batch transiently fails outright.

use crate::{Error, Result};
use core::time::Duration;

/// Batch sizing for one generator run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    /// Keys needed to cover the horizon: `floor(L * T)`.
    pub demand: u64,
    /// Target surplus `G = max(0, L*T - S)`.
    pub target: u64,
    /// Raw candidates per attempt `Y = ceil(G / y)`.
    pub attempt: usize,
}

impl BatchPlan {
    pub const fn is_satisfied(&self) -> bool {
        self.target == 0
    }

    /// Limits `Y` to `max_batch`. A plan with a target never drops below one
    /// candidate per attempt.
    #[must_use]
    pub fn capped(self, max_batch: usize) -> Self {
        let attempt = if self.target == 0 {
            0
        } else {
            self.attempt.min(max_batch).max(1)
        };
        Self { attempt, ..self }
    }
}

/// Computes `G` and `Y` for the given load, horizon, pool size and yield.
///
/// Non-finite or negative loads are treated as zero demand.
///
/// # Example
/// ```
/// use core::time::Duration;
/// use keypool::{plan_batch, YieldEstimate};
///
/// let plan = plan_batch(5.0, Duration::from_secs(60), 0, YieldEstimate::new(0.9));
/// assert_eq!(plan.target, 300);
/// assert_eq!(plan.attempt, 334);
/// ```
pub fn plan_batch(
    load: f64,
    horizon: Duration,
    pool_size: usize,
    estimate: YieldEstimate,
) -> BatchPlan {
    let projected = load * horizon.as_secs_f64();
    // `as` saturates and maps NaN to zero.
    let demand = if projected.is_finite() && projected > 0.0 {
        projected as u64
    } else {
        0
    };
    let target = demand.saturating_sub(pool_size as u64);
    let attempt = if target == 0 {
        0
    } else {
        (target as f64 / estimate.value()).ceil() as usize
    };

    BatchPlan {
        demand,
        target,
        attempt,
    }
}

/// Smoothed fraction of generated candidates that end up in the pool.
///
/// Always in `(0, 1]`. Construction clamps out-of-range input.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct YieldEstimate(f64);

impl YieldEstimate {
    /// Smallest representable estimate, used when a value has no usable floor.
    pub const MIN: f64 = 1e-6;

    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self(Self::MIN);
        }
        Self(value.clamp(Self::MIN, 1.0))
    }

    pub const fn value(self) -> f64 {
        self.0
    }
}

/// Exponential smoothing parameters for [`YieldEstimate`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct YieldPolicy {
    alpha: f64,
    floor: f64,
}

impl YieldPolicy {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] unless both `alpha` and `floor` lie in
    /// `(0, 1]`.
    pub fn new(alpha: f64, floor: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::config(format!(
                "yield smoothing factor must be in (0, 1], got {alpha}"
            )));
        }
        if !(floor > 0.0 && floor <= 1.0) {
            return Err(Error::config(format!(
                "yield floor must be in (0, 1], got {floor}"
            )));
        }
        Ok(Self { alpha, floor })
    }

    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    pub const fn floor(&self) -> f64 {
        self.floor
    }

    /// Clamps `raw` into `[floor, 1]`.
    pub fn clamp(&self, raw: f64) -> YieldEstimate {
        if raw.is_nan() {
            return YieldEstimate::new(self.floor);
        }
        YieldEstimate::new(raw.clamp(self.floor, 1.0))
    }

    /// Folds one run's totals into the previous estimate.
    ///
    /// `y' = alpha * clamp(succeeded / attempted) + (1 - alpha) * y`. A run
    /// with no attempts or no successes carries no usable signal and leaves
    /// the (floor-clamped) previous estimate unchanged.
    pub fn update(&self, previous: YieldEstimate, attempted: u64, succeeded: u64) -> YieldEstimate {
        let previous = self.clamp(previous.value());
        if attempted == 0 || succeeded == 0 {
            return previous;
        }

        let raw = self.clamp(succeeded as f64 / attempted as f64);
        self.clamp(self.alpha * raw.value() + (1.0 - self.alpha) * previous.value())
    }
}

impl Default for YieldPolicy {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            floor: 0.05,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn plans_first_run_from_empty_pool() {
        let plan = plan_batch(5.0, MINUTE, 0, YieldEstimate::new(0.9));
        assert_eq!(
            plan,
            BatchPlan {
                demand: 300,
                target: 300,
                attempt: 334,
            }
        );
    }

    #[test]
    fn satisfied_when_pool_covers_demand() {
        let plan = plan_batch(5.0, MINUTE, 300, YieldEstimate::new(0.9));
        assert!(plan.is_satisfied());
        assert_eq!(plan.attempt, 0);

        let plan = plan_batch(5.0, MINUTE, 10_000, YieldEstimate::new(0.9));
        assert!(plan.is_satisfied());
    }

    #[test]
    fn subtracts_existing_pool() {
        let plan = plan_batch(5.0, MINUTE, 120, YieldEstimate::new(1.0));
        assert_eq!(plan.target, 180);
        assert_eq!(plan.attempt, 180);
    }

    #[test]
    fn capped_limits_attempt_only() {
        let plan = plan_batch(1e15, MINUTE, 0, YieldEstimate::new(0.9)).capped(10_000);
        assert_eq!(plan.target, 60_000_000_000_000_000);
        assert_eq!(plan.attempt, 10_000);

        let plan = plan_batch(5.0, MINUTE, 0, YieldEstimate::new(0.9)).capped(10_000);
        assert_eq!(plan.attempt, 334);

        assert_eq!(plan_batch(5.0, MINUTE, 0, YieldEstimate::new(0.9)).capped(0).attempt, 1);
        assert_eq!(plan_batch(0.0, MINUTE, 0, YieldEstimate::new(0.9)).capped(50).attempt, 0);
    }

    #[test]
    fn degenerate_loads_mean_no_demand() {
        for load in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            assert!(plan_batch(load, MINUTE, 0, YieldEstimate::new(0.5)).is_satisfied());
        }
    }

    #[test]
    fn floor_bounds_attempt_size() {
        let policy = YieldPolicy::new(0.3, 0.05).unwrap();
        let estimate = policy.clamp(0.0);
        let plan = plan_batch(5.0, MINUTE, 0, estimate);
        assert_eq!(plan.attempt, 6_000);
    }

    #[test]
    fn smoothing_blends_toward_raw_yield() {
        let policy = YieldPolicy::new(0.3, 0.05).unwrap();
        let next = policy.update(YieldEstimate::new(0.9), 1_000, 500);
        assert!((next.value() - (0.3 * 0.5 + 0.7 * 0.9)).abs() < 1e-12);
    }

    #[test]
    fn zero_success_leaves_estimate_unchanged() {
        let policy = YieldPolicy::new(0.3, 0.05).unwrap();
        let previous = YieldEstimate::new(0.8);
        assert_eq!(policy.update(previous, 400, 0), previous);
        assert_eq!(policy.update(previous, 0, 0), previous);
    }

    #[test]
    fn estimate_stays_within_floor_and_one() {
        let policy = YieldPolicy::new(0.9, 0.2).unwrap();
        let mut estimate = YieldEstimate::new(0.5);
        let runs = [(1_000, 1), (10, 10), (1_000_000, 1), (5, 0), (7, 7), (3, 1)];
        for (attempted, succeeded) in runs {
            estimate = policy.update(estimate, attempted, succeeded);
            assert!(estimate.value() >= 0.2, "{estimate:?}");
            assert!(estimate.value() <= 1.0, "{estimate:?}");
        }
    }

    #[test]
    fn rejects_out_of_range_policy() {
        assert!(YieldPolicy::new(0.0, 0.1).is_err());
        assert!(YieldPolicy::new(1.5, 0.1).is_err());
        assert!(YieldPolicy::new(0.3, 0.0).is_err());
        assert!(YieldPolicy::new(0.3, f64::NAN).is_err());
        assert!(YieldPolicy::new(1.0, 1.0).is_ok());
    }

    #[test]
    fn estimate_construction_clamps() {
        assert_eq!(YieldEstimate::new(2.0).value(), 1.0);
        assert_eq!(YieldEstimate::new(-1.0).value(), YieldEstimate::MIN);
        assert_eq!(YieldEstimate::new(f64::NAN).value(), YieldEstimate::MIN);
    }
}
