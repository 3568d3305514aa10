use crate::{Error, Result};

/// Minimum number of keys the local cache should hold before a transfer is
/// triggered.
///
/// The load-derived form is a non-decreasing step function of the
/// instance's serve rate: `baseline` below `cutoff`, plus `keys_per_step` for
/// every full `step` of load above it.
///
/// # Example
/// ```
/// use keypool::MinKeys;
///
/// let min = MinKeys::load_step(5, 10.0, 5.0, 10).unwrap();
/// assert_eq!(min.threshold(3.0), 5);
/// assert_eq!(min.threshold(10.0), 5);
/// assert_eq!(min.threshold(15.0), 15);
/// assert_eq!(min.threshold(27.0), 35);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MinKeys {
    Static(usize),
    LoadStep {
        baseline: usize,
        cutoff: f64,
        step: f64,
        keys_per_step: usize,
    },
}

impl MinKeys {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `step` is not a positive finite
    /// number or `cutoff` is negative or non-finite.
    pub fn load_step(baseline: usize, cutoff: f64, step: f64, keys_per_step: usize) -> Result<Self> {
        if !(step.is_finite() && step > 0.0) {
            return Err(Error::config(format!("load step must be positive, got {step}")));
        }
        if !(cutoff.is_finite() && cutoff >= 0.0) {
            return Err(Error::config(format!(
                "load cutoff must be non-negative, got {cutoff}"
            )));
        }
        Ok(Self::LoadStep {
            baseline,
            cutoff,
            step,
            keys_per_step,
        })
    }

    /// Keys required at `load` (keys per second served by this instance).
    pub fn threshold(&self, load: f64) -> usize {
        match *self {
            Self::Static(min) => min,
            Self::LoadStep {
                baseline,
                cutoff,
                step,
                keys_per_step,
            } => {
                if !(load > cutoff) {
                    return baseline;
                }
                // `as` saturates on overflow and infinity.
                let steps = ((load - cutoff) / step).floor() as usize;
                baseline.saturating_add(steps.saturating_mul(keys_per_step))
            }
        }
    }

    /// Threshold at `load`, limited to `capacity`.
    pub(crate) fn capped(&self, load: f64, capacity: usize) -> usize {
        self.threshold(load).min(capacity)
    }
}

impl Default for MinKeys {
    fn default() -> Self {
        Self::Static(5)
    }
}
