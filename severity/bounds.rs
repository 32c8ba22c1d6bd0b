use super::SeverityError;
use crate::catalog::FeatureStats;
use serde::{Deserialize, Serialize};

/// A symbolic bound resolved against the feature statistics when the engine is built.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoundAnchor {
    ObservedMin,
    ObservedMax,
}

/// One threshold of a rubric, either a literal or an anchor on the observed range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Bound {
    Value(f64),
    Anchor(BoundAnchor),
}

impl Bound {
    pub fn resolve(self, stats: &FeatureStats) -> f64 {
        match self {
            Bound::Value(v) => v,
            Bound::Anchor(BoundAnchor::ObservedMin) => stats.observed_min,
            Bound::Anchor(BoundAnchor::ObservedMax) => stats.observed_max,
        }
    }
}

/// Whether a reading matches a bound by being strictly below it or strictly above it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoundsDirection {
    #[default]
    Ascending,
    Descending,
}

/// A resolved, ordered threshold table with its parallel rubric.
#[derive(Debug, Clone, PartialEq)]
pub struct SeverityComponentBounds {
    thresholds: Vec<f64>,
    rubric: Vec<u32>,
    direction: BoundsDirection,
}

impl SeverityComponentBounds {
    pub fn new(
        component: &str,
        thresholds: Vec<f64>,
        rubric: Vec<u32>,
        direction: BoundsDirection,
    ) -> Result<Self, SeverityError> {
        if thresholds.is_empty() {
            return Err(SeverityError::EmptyBounds {
                component: component.to_string(),
            });
        }
        if thresholds.len() != rubric.len() {
            return Err(SeverityError::RubricMismatch {
                component: component.to_string(),
                bounds: thresholds.len(),
                rubric: rubric.len(),
            });
        }
        if let Some(position) = thresholds.iter().position(|t| t.is_nan()) {
            return Err(SeverityError::NanBound {
                component: component.to_string(),
                position,
            });
        }
        Ok(Self {
            thresholds,
            rubric,
            direction,
        })
    }

    /// Resolves anchors in `bounds` against `stats`.
    pub fn resolve(
        component: &str,
        bounds: &[Bound],
        rubric: &[u32],
        direction: BoundsDirection,
        stats: &FeatureStats,
    ) -> Result<Self, SeverityError> {
        let thresholds = bounds.iter().map(|b| b.resolve(stats)).collect();
        Self::new(component, thresholds, rubric.to_vec(), direction)
    }

    /// Points for one reading: the rubric entry of the first threshold the reading is
    /// strictly beyond in the table's direction, scanning in table order. No match
    /// scores zero.
    #[inline]
    pub fn score(&self, value: f64) -> u32 {
        let matched = match self.direction {
            BoundsDirection::Ascending => self.thresholds.iter().position(|&t| value < t),
            BoundsDirection::Descending => self.thresholds.iter().position(|&t| value > t),
        };
        matched.map_or(0, |i| self.rubric[i])
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    pub fn max_points(&self) -> u32 {
        self.rubric.iter().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VariableKind;

    fn stats(min: f64, max: f64) -> FeatureStats {
        FeatureStats {
            kind: VariableKind::Continuous,
            value_count: 1.0,
            observed_min: min,
            observed_max: max,
            reference_min: min,
            reference_max: max,
            default_value: 0.0,
        }
    }

    fn respiratory(min: f64, max: f64) -> SeverityComponentBounds {
        let bounds = [
            Bound::Anchor(BoundAnchor::ObservedMin),
            Bound::Value(8.0),
            Bound::Value(9.0),
            Bound::Value(15.0),
            Bound::Value(21.0),
            Bound::Value(30.0),
            Bound::Anchor(BoundAnchor::ObservedMax),
        ];
        SeverityComponentBounds::resolve(
            "respiratory_rate",
            &bounds,
            &[3, 2, 1, 0, 1, 2, 3],
            BoundsDirection::Ascending,
            &stats(min, max),
        )
        .unwrap()
    }

    #[test]
    fn anchors_resolve_against_the_observed_range() {
        let rubric = respiratory(2.0, 60.0);
        assert_eq!(rubric.thresholds(), &[2.0, 8.0, 9.0, 15.0, 21.0, 30.0, 60.0]);
        assert_eq!(rubric.max_points(), 3);
    }

    #[test]
    fn normal_reading_scores_zero() {
        assert_eq!(respiratory(0.0, 60.0).score(12.0), 0);
    }

    #[test]
    fn first_match_wins_when_ascending() {
        let rubric = respiratory(0.0, 60.0);
        // 7 is not below the min anchor (0) but is below 8, the second bound
        assert_eq!(rubric.score(7.0), 2);
        assert_eq!(rubric.score(8.5), 1);
        assert_eq!(rubric.score(25.0), 2);
        assert_eq!(rubric.score(45.0), 3);
        assert_eq!(rubric.score(-1.0), 3);
        assert_eq!(rubric.score(60.0), 0);
    }

    #[test]
    fn bounds_are_strict() {
        let rubric = respiratory(0.0, 60.0);
        assert_eq!(rubric.score(8.0), 1);
        assert_eq!(rubric.score(15.0), 1);
    }

    #[test]
    fn descending_tables_match_above_the_bound() {
        let bilirubin = SeverityComponentBounds::new(
            "liver",
            vec![12.0, 5.9, 1.9, 1.1],
            vec![4, 3, 2, 1],
            BoundsDirection::Descending,
        )
        .unwrap();
        assert_eq!(bilirubin.score(13.0), 4);
        assert_eq!(bilirubin.score(6.0), 3);
        assert_eq!(bilirubin.score(1.5), 1);
        assert_eq!(bilirubin.score(1.1), 0);
        assert_eq!(bilirubin.score(0.4), 0);
    }

    #[test]
    fn malformed_tables_are_rejected() {
        assert!(matches!(
            SeverityComponentBounds::new("x", vec![], vec![], BoundsDirection::Ascending),
            Err(SeverityError::EmptyBounds { .. })
        ));
        assert!(matches!(
            SeverityComponentBounds::new("x", vec![1.0, 2.0], vec![1], BoundsDirection::Ascending),
            Err(SeverityError::RubricMismatch { bounds: 2, rubric: 1, .. })
        ));
        assert!(matches!(
            SeverityComponentBounds::new("x", vec![1.0, f64::NAN], vec![1, 2], BoundsDirection::Ascending),
            Err(SeverityError::NanBound { position: 1, .. })
        ));
    }

    #[test]
    fn bounds_deserialize_from_mixed_toml_arrays() {
        #[derive(Deserialize)]
        struct Table {
            bounds: Vec<Bound>,
            direction: BoundsDirection,
        }
        let table: Table = toml::from_str(
            r#"
            bounds = ["observed_min", 8, 9.5, "observed_max"]
            direction = "descending"
            "#,
        )
        .unwrap();
        assert_eq!(
            table.bounds,
            vec![
                Bound::Anchor(BoundAnchor::ObservedMin),
                Bound::Value(8.0),
                Bound::Value(9.5),
                Bound::Anchor(BoundAnchor::ObservedMax),
            ]
        );
        assert_eq!(table.direction, BoundsDirection::Descending);
    }
}
