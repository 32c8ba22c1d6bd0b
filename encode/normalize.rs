// ========================================================================================
//
//                           THE VALUE NORMALIZER
//
// ========================================================================================
//
// A pure mapping from a raw observation to the fixed output range. It is the single
// source of truth for encoding: real observations, the seeded defaults of a fresh
// timeline, the admission hour-of-day row and the composite totals all go through it,
// so that a default and a genuine reading of the same value always encode identically.

use crate::catalog::{FeatureCatalog, FeatureStats};
use crate::config::{NormalizationConfig, NormalizationMethod, OutputRange};
use crate::types::{FeatureIndex, VariableKind};
use ndarray::Array1;

/// Highest hour of day; the admission hour-of-day row spans `[0, LAST_HOUR_OF_DAY]`.
pub const LAST_HOUR_OF_DAY: f64 = 23.0;

/// Linear interpolation of `x` from `[x0, x1]` onto `[y0, y1]`.
///
/// The endpoints map exactly: `x0` yields `y0` and `x1` yields `y1` bit-for-bit. With
/// `clamp` set, values outside the domain saturate at the endpoints; otherwise they
/// extrapolate along the same line. A degenerate domain (`x1 <= x0`) acts as a step at
/// `x0`.
#[inline]
pub fn interpolate(x: f64, x0: f64, x1: f64, y0: f64, y1: f64, clamp: bool) -> f64 {
    if x1 <= x0 {
        return if x < x0 { y0 } else { y1 };
    }
    let mut t = (x - x0) / (x1 - x0);
    if clamp {
        t = t.clamp(0.0, 1.0);
    }
    (1.0 - t) * y0 + t * y1
}

/// Encodes raw observations according to the run's normalization settings.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    method: NormalizationMethod,
    range: OutputRange,
    healthy_is_low: bool,
    clamp: bool,
}

impl Normalizer {
    pub fn new(config: &NormalizationConfig, range: OutputRange) -> Self {
        Self {
            method: config.method,
            range,
            healthy_is_low: config.healthy_is_low,
            clamp: config.clamp,
        }
    }

    pub fn range(&self) -> OutputRange {
        self.range
    }

    /// Encodes `raw` for a feature with the given statistics.
    ///
    /// `ref_min`/`ref_max` come from the event being encoded, since reference bands may
    /// differ between the raw items that share one feature row.
    pub fn normalize(
        &self,
        raw: f64,
        kind: VariableKind,
        stats: &FeatureStats,
        ref_min: f64,
        ref_max: f64,
    ) -> f64 {
        let (lo, hi) = (self.range.min, self.range.max);
        match kind {
            VariableKind::Binary | VariableKind::BinaryPoint => {
                interpolate(raw, 0.0, 1.0, lo, hi, self.clamp)
            }
            VariableKind::ContinuousCumulative => self.observed_linear(raw, stats),
            VariableKind::Continuous => match self.method {
                NormalizationMethod::ReferenceMinMax => {
                    interpolate(raw, ref_min, ref_max, lo, hi, self.clamp)
                }
                NormalizationMethod::MinMax | NormalizationMethod::Reference => {
                    self.observed_linear(raw, stats)
                }
            },
            VariableKind::ContinuousWithReference => match self.method {
                NormalizationMethod::MinMax => self.observed_linear(raw, stats),
                NormalizationMethod::ReferenceMinMax => {
                    interpolate(raw, ref_min, ref_max, lo, hi, self.clamp)
                }
                NormalizationMethod::Reference => self.reference_banded(raw, stats, ref_min, ref_max),
            },
        }
    }

    /// Encodes the catalog default of a feature, using the feature's own kind and band.
    pub fn normalize_default(&self, stats: &FeatureStats) -> f64 {
        self.normalize(
            stats.default_value,
            stats.kind,
            stats,
            stats.reference_min,
            stats.reference_max,
        )
    }

    /// The encoded default of every feature row, in row order. A fresh timeline is this
    /// column broadcast across the horizon.
    pub fn seed_column(&self, catalog: &FeatureCatalog) -> Array1<f64> {
        (0..catalog.feature_rows())
            .map(|row| self.normalize_default(catalog.stats(FeatureIndex(row))))
            .collect()
    }

    /// Rescales an hour of day in `[0, 23]` onto the output range.
    #[inline]
    pub fn hour_of_day(&self, hour: f64) -> f64 {
        interpolate(hour, 0.0, LAST_HOUR_OF_DAY, self.range.min, self.range.max, false)
    }

    #[inline]
    fn observed_linear(&self, raw: f64, stats: &FeatureStats) -> f64 {
        interpolate(
            raw,
            stats.observed_min,
            stats.observed_max,
            self.range.min,
            self.range.max,
            self.clamp,
        )
    }

    /// Three-piece encoding around the reference band. Inside the band the value maps to
    /// the healthy endpoint; below it, the further from the band the further from
    /// healthy, and likewise above it.
    fn reference_banded(&self, raw: f64, stats: &FeatureStats, ref_min: f64, ref_max: f64) -> f64 {
        let (healthy, severe) = if self.healthy_is_low {
            (self.range.min, self.range.max)
        } else {
            (self.range.max, self.range.min)
        };

        if raw < ref_min {
            interpolate(raw, stats.observed_min, ref_min, severe, healthy, self.clamp)
        } else if raw > ref_max {
            interpolate(raw, ref_max, stats.observed_max, healthy, severe, self.clamp)
        } else {
            healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn stats(kind: VariableKind, min: f64, max: f64, ref_min: f64, ref_max: f64) -> FeatureStats {
        FeatureStats {
            kind,
            value_count: 1.0,
            observed_min: min,
            observed_max: max,
            reference_min: ref_min,
            reference_max: ref_max,
            default_value: 0.0,
        }
    }

    fn normalizer(method: NormalizationMethod, healthy_is_low: bool, clamp: bool) -> Normalizer {
        Normalizer::new(
            &NormalizationConfig {
                method,
                healthy_is_low,
                clamp,
            },
            OutputRange::default(),
        )
    }

    #[test]
    fn continuous_endpoints_map_exactly() {
        let n = normalizer(NormalizationMethod::MinMax, true, true);
        for (min, max) in [(0.0, 100.0), (-3.7, 41.2), (35.0, 42.0), (0.1, 0.3)] {
            let s = stats(VariableKind::Continuous, min, max, min, max);
            assert_eq!(n.normalize(min, VariableKind::Continuous, &s, min, max), 0.0);
            assert_eq!(n.normalize(max, VariableKind::Continuous, &s, min, max), 255.0);
            let c = stats(VariableKind::ContinuousCumulative, min, max, 0.0, 0.0);
            assert_eq!(n.normalize(min, VariableKind::ContinuousCumulative, &c, 0.0, 0.0), 0.0);
            assert_eq!(n.normalize(max, VariableKind::ContinuousCumulative, &c, 0.0, 0.0), 255.0);
        }
    }

    #[test]
    fn continuous_is_monotonic_non_decreasing() {
        let n = normalizer(NormalizationMethod::MinMax, true, true);
        let s = stats(VariableKind::Continuous, 12.5, 310.0, 60.0, 100.0);
        let mut previous = f64::NEG_INFINITY;
        for step in 0..=400 {
            let raw = -20.0 + step as f64;
            let encoded = n.normalize(raw, VariableKind::Continuous, &s, 60.0, 100.0);
            assert!(encoded >= previous, "not monotonic at raw={raw}");
            previous = encoded;
        }
    }

    #[test]
    fn midpoint_encodes_to_range_midpoint() {
        let n = normalizer(NormalizationMethod::MinMax, true, true);
        let s = stats(VariableKind::Continuous, 0.0, 100.0, 0.0, 100.0);
        assert_eq!(n.normalize(50.0, VariableKind::Continuous, &s, 0.0, 100.0), 127.5);
    }

    #[test]
    fn binary_kinds_map_zero_and_one_to_range_ends() {
        let n = normalizer(NormalizationMethod::MinMax, true, true);
        let s = stats(VariableKind::Binary, 0.0, 0.0, 0.0, 0.0);
        for kind in [VariableKind::Binary, VariableKind::BinaryPoint] {
            assert_eq!(n.normalize(0.0, kind, &s, 0.0, 0.0), 0.0);
            assert_eq!(n.normalize(1.0, kind, &s, 0.0, 0.0), 255.0);
        }
    }

    #[test]
    fn clamping_is_a_configuration_choice() {
        let s = stats(VariableKind::Continuous, 0.0, 100.0, 0.0, 100.0);
        let clamped = normalizer(NormalizationMethod::MinMax, true, true);
        let free = normalizer(NormalizationMethod::MinMax, true, false);

        assert_eq!(clamped.normalize(150.0, VariableKind::Continuous, &s, 0.0, 100.0), 255.0);
        assert_eq!(clamped.normalize(-10.0, VariableKind::Continuous, &s, 0.0, 100.0), 0.0);
        assert_abs_diff_eq!(
            free.normalize(150.0, VariableKind::Continuous, &s, 0.0, 100.0),
            382.5,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            free.normalize(-10.0, VariableKind::Continuous, &s, 0.0, 100.0),
            -25.5,
            epsilon = 1e-9
        );
    }

    #[test]
    fn reference_band_with_healthy_low() {
        let n = normalizer(NormalizationMethod::Reference, true, true);
        let kind = VariableKind::ContinuousWithReference;
        let s = stats(kind, 0.0, 200.0, 60.0, 100.0);

        assert_eq!(n.normalize(80.0, kind, &s, 60.0, 100.0), 0.0);
        assert_eq!(n.normalize(60.0, kind, &s, 60.0, 100.0), 0.0);
        assert_eq!(n.normalize(0.0, kind, &s, 60.0, 100.0), 255.0);
        assert_abs_diff_eq!(n.normalize(30.0, kind, &s, 60.0, 100.0), 127.5, epsilon = 1e-9);
        assert_abs_diff_eq!(n.normalize(150.0, kind, &s, 60.0, 100.0), 127.5, epsilon = 1e-9);
        assert_eq!(n.normalize(200.0, kind, &s, 60.0, 100.0), 255.0);
    }

    #[test]
    fn reference_band_with_healthy_high() {
        let n = normalizer(NormalizationMethod::Reference, false, true);
        let kind = VariableKind::ContinuousWithReference;
        let s = stats(kind, 0.0, 200.0, 60.0, 100.0);

        assert_eq!(n.normalize(80.0, kind, &s, 60.0, 100.0), 255.0);
        assert_eq!(n.normalize(0.0, kind, &s, 60.0, 100.0), 0.0);
        assert_eq!(n.normalize(200.0, kind, &s, 60.0, 100.0), 0.0);
        assert_abs_diff_eq!(n.normalize(30.0, kind, &s, 60.0, 100.0), 127.5, epsilon = 1e-9);
    }

    #[test]
    fn reference_method_leaves_plain_continuous_linear() {
        let n = normalizer(NormalizationMethod::Reference, true, true);
        let s = stats(VariableKind::Continuous, 0.0, 100.0, 40.0, 60.0);
        assert_eq!(n.normalize(50.0, VariableKind::Continuous, &s, 40.0, 60.0), 127.5);
    }

    #[test]
    fn reference_min_max_uses_the_event_band() {
        let n = normalizer(NormalizationMethod::ReferenceMinMax, true, true);
        let s = stats(VariableKind::Continuous, 0.0, 1000.0, 0.0, 0.0);
        assert_eq!(n.normalize(10.0, VariableKind::Continuous, &s, 10.0, 20.0), 0.0);
        assert_eq!(n.normalize(15.0, VariableKind::Continuous, &s, 10.0, 20.0), 127.5);
        assert_eq!(n.normalize(20.0, VariableKind::Continuous, &s, 10.0, 20.0), 255.0);
    }

    #[test]
    fn degenerate_domain_is_a_step() {
        assert_eq!(interpolate(-1.0, 0.0, 0.0, 0.0, 255.0, true), 0.0);
        assert_eq!(interpolate(0.0, 0.0, 0.0, 0.0, 255.0, true), 255.0);
        assert_eq!(interpolate(3.0, 0.0, 0.0, 0.0, 255.0, false), 255.0);
    }

    #[test]
    fn unused_row_default_encodes_to_range_minimum() {
        let n = normalizer(NormalizationMethod::MinMax, true, true);
        assert_eq!(n.normalize_default(&FeatureStats::UNUSED), 0.0);
    }

    #[test]
    fn hour_of_day_spans_the_range() {
        let n = normalizer(NormalizationMethod::MinMax, true, true);
        assert_eq!(n.hour_of_day(0.0), 0.0);
        assert_eq!(n.hour_of_day(23.0), 255.0);
    }
}
