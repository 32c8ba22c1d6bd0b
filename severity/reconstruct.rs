//! Inverse of the min-max encoding: maps encoded values back onto a feature's observed
//! range with the first-order spline `[OUT_MIN, OUT_MAX] -> [observed_min, observed_max]`.

use crate::catalog::FeatureStats;
use crate::config::OutputRange;
use crate::normalize::interpolate;
use ndarray::{Array1, ArrayView1};

#[derive(Debug, Clone, Copy)]
pub struct Reconstruction {
    range: OutputRange,
}

impl Reconstruction {
    pub fn new(range: OutputRange) -> Self {
        Self { range }
    }

    /// Unclamped: encoded values outside the output range extrapolate linearly.
    #[inline]
    pub fn value(&self, encoded: f64, stats: &FeatureStats) -> f64 {
        interpolate(
            encoded,
            self.range.min,
            self.range.max,
            stats.observed_min,
            stats.observed_max,
            false,
        )
    }

    pub fn series(&self, encoded: ArrayView1<'_, f64>, stats: &FeatureStats) -> Array1<f64> {
        encoded.mapv(|e| self.value(e, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VariableKind;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn stats(min: f64, max: f64) -> FeatureStats {
        FeatureStats {
            kind: VariableKind::Continuous,
            value_count: 1.0,
            observed_min: min,
            observed_max: max,
            reference_min: min,
            reference_max: max,
            default_value: min,
        }
    }

    #[test]
    fn range_ends_reconstruct_to_the_observed_range() {
        let r = Reconstruction::new(OutputRange::default());
        let s = stats(30.0, 42.0);
        assert_eq!(r.value(0.0, &s), 30.0);
        assert_eq!(r.value(255.0, &s), 42.0);
        assert_abs_diff_eq!(r.value(127.5, &s), 36.0, epsilon = 1e-12);
    }

    #[test]
    fn reconstruction_extrapolates_outside_the_range() {
        let r = Reconstruction::new(OutputRange::default());
        let s = stats(0.0, 100.0);
        assert_abs_diff_eq!(r.value(382.5, &s), 150.0, epsilon = 1e-9);
        assert_abs_diff_eq!(r.value(-25.5, &s), -10.0, epsilon = 1e-9);
    }

    #[test]
    fn series_maps_every_hour() {
        let r = Reconstruction::new(OutputRange { min: 0.0, max: 1.0 });
        let s = stats(0.0, 10.0);
        let out = r.series(array![0.0, 0.5, 1.0].view(), &s);
        assert_abs_diff_eq!(out[1], 5.0, epsilon = 1e-12);
        assert_eq!(out[2], 10.0);
    }
}
