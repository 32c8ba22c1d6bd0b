// ========================================================================================
//
//                           THE SEVERITY SCORE ENGINE
//
// ========================================================================================
//
// One engine instance per scoring system. The engine is built once, when the catalog is
// frozen, by resolving every component's bounds anchors and sentinel values against the
// catalog. After that, scoring a visit is a read-only pass over its timeline:
//
// 1.  Reconstruct each component's hourly series in original units.
// 2.  Drop hours still holding the row's seeded default; they carry no reading.
// 3.  Score every remaining hour against the component's rubric.
// 4.  Aggregate the `[components, hours]` point matrix into one total.

use super::bounds::{Bound, BoundsDirection, SeverityComponentBounds};
use super::reconstruct::Reconstruction;
use super::SeverityError;
use crate::catalog::{FeatureCatalog, FeatureStats};
use crate::config::OutputRange;
use crate::types::FeatureIndex;
use crate::visit::{VisitSeed, VisitState};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

// ========================================================================================
//                                  Configuration
// ========================================================================================

fn unit_scale() -> f64 {
    1.0
}

/// Where a component's hourly reading comes from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ComponentInput {
    /// `numerator / (denominator * scale)`, hour by hour.
    Ratio {
        numerator: FeatureIndex,
        denominator: FeatureIndex,
        #[serde(default = "unit_scale")]
        scale: f64,
    },
    Feature { feature: FeatureIndex },
}

impl ComponentInput {
    /// Every timeline row this input reads.
    pub fn rows(&self) -> Vec<FeatureIndex> {
        match *self {
            ComponentInput::Ratio {
                numerator,
                denominator,
                ..
            } => vec![numerator, denominator],
            ComponentInput::Feature { feature } => vec![feature],
        }
    }

    /// The row whose statistics resolve bound anchors.
    fn anchor_row(&self) -> FeatureIndex {
        match *self {
            ComponentInput::Ratio { numerator, .. } => numerator,
            ComponentInput::Feature { feature } => feature,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentConfig {
    pub name: String,
    pub input: ComponentInput,
    #[serde(default)]
    pub direction: BoundsDirection,
    pub bounds: Vec<Bound>,
    pub rubric: Vec<u32>,
}

/// How hourly component points collapse into one visit total.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAggregation {
    /// Sum over components of each component's worst hour.
    #[default]
    ComponentMaxSum,
    /// Worst hour of the per-hour sum across components.
    HourlyTotalMax,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    pub name: String,
    /// A visit is predicted positive when its total strictly exceeds this.
    pub threshold: f64,
    #[serde(default)]
    pub aggregation: ScoreAggregation,
    pub components: Vec<ComponentConfig>,
}

// ========================================================================================
//                                 Resolved components
// ========================================================================================

/// Reads one timeline row back in original units, hiding hours at the seeded default.
#[derive(Debug, Clone)]
struct RowReader {
    row: FeatureIndex,
    stats: FeatureStats,
    sentinel: f64,
}

impl RowReader {
    fn build(
        component: &str,
        row: FeatureIndex,
        catalog: &FeatureCatalog,
        seed: &VisitSeed,
        reconstruction: &Reconstruction,
    ) -> Result<Self, SeverityError> {
        if row.0 >= seed.feature_rows() {
            return Err(SeverityError::RowOutOfRange {
                component: component.to_string(),
                row,
                feature_rows: seed.feature_rows(),
            });
        }
        if !catalog.is_defined(row) {
            log::warn!(
                "Severity component '{component}' reads feature row {row}, which the catalog never defined; it will never score."
            );
        }
        let stats = *catalog.stats(row);
        let sentinel = reconstruction.value(seed.encoded_default(row), &stats);
        Ok(Self {
            row,
            stats,
            sentinel,
        })
    }

    #[inline]
    fn reading(&self, visit: &VisitState, hour: usize, reconstruction: &Reconstruction) -> Option<f64> {
        let value = reconstruction.value(visit.row(self.row)[hour], &self.stats);
        (value != self.sentinel).then_some(value)
    }
}

#[derive(Debug, Clone)]
enum ResolvedInput {
    Feature(RowReader),
    Ratio {
        numerator: RowReader,
        denominator: RowReader,
        scale: f64,
    },
}

impl ResolvedInput {
    fn reading(&self, visit: &VisitState, hour: usize, reconstruction: &Reconstruction) -> Option<f64> {
        match self {
            ResolvedInput::Feature(reader) => reader.reading(visit, hour, reconstruction),
            ResolvedInput::Ratio {
                numerator,
                denominator,
                scale,
            } => {
                let top = numerator.reading(visit, hour, reconstruction)?;
                let bottom = denominator.reading(visit, hour, reconstruction)? * scale;
                (bottom != 0.0).then(|| top / bottom)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct ResolvedComponent {
    name: String,
    input: ResolvedInput,
    bounds: SeverityComponentBounds,
}

// ========================================================================================
//                                 Scores and tallies
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitScore {
    pub total: u32,
    /// Worst hourly points of each component, in configuration order.
    pub component_maxima: Vec<u32>,
    pub prediction: bool,
}

/// Running confusion counts of one system's predictions against observed outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionTally {
    pub true_positive: u64,
    pub false_positive: u64,
    pub true_negative: u64,
    pub false_negative: u64,
}

impl PredictionTally {
    pub fn record(&mut self, prediction: bool, outcome: bool) {
        match (prediction, outcome) {
            (true, true) => self.true_positive += 1,
            (true, false) => self.false_positive += 1,
            (false, false) => self.true_negative += 1,
            (false, true) => self.false_negative += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }
}

impl fmt::Display for PredictionTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} visits (tp={}, fp={}, tn={}, fn={})",
            self.total(),
            self.true_positive,
            self.false_positive,
            self.true_negative,
            self.false_negative
        )
    }
}

// ========================================================================================
//                                     The engine
// ========================================================================================

#[derive(Debug, Clone)]
pub struct SeverityScoreEngine {
    name: String,
    threshold: f64,
    aggregation: ScoreAggregation,
    reconstruction: Reconstruction,
    components: Vec<ResolvedComponent>,
    tally: PredictionTally,
}

impl SeverityScoreEngine {
    /// Resolves a system against the frozen catalog and the run's seed column.
    pub fn build(
        config: &SystemConfig,
        catalog: &FeatureCatalog,
        seed: &VisitSeed,
        range: OutputRange,
    ) -> Result<Self, SeverityError> {
        let reconstruction = Reconstruction::new(range);
        let components = config
            .components
            .iter()
            .map(|component| {
                let name = component.name.as_str();
                let reader = |row| RowReader::build(name, row, catalog, seed, &reconstruction);
                let input = match component.input {
                    ComponentInput::Feature { feature } => ResolvedInput::Feature(reader(feature)?),
                    ComponentInput::Ratio {
                        numerator,
                        denominator,
                        scale,
                    } => {
                        if !scale.is_finite() || scale == 0.0 {
                            return Err(SeverityError::InvalidScale {
                                component: component.name.clone(),
                                scale,
                            });
                        }
                        ResolvedInput::Ratio {
                            numerator: reader(numerator)?,
                            denominator: reader(denominator)?,
                            scale,
                        }
                    }
                };
                let bounds = SeverityComponentBounds::resolve(
                    name,
                    &component.bounds,
                    &component.rubric,
                    component.direction,
                    catalog.stats(component.input.anchor_row()),
                )?;
                Ok(ResolvedComponent {
                    name: component.name.clone(),
                    input,
                    bounds,
                })
            })
            .collect::<Result<Vec<_>, SeverityError>>()?;

        log::debug!(
            "Severity system '{}' resolved with components [{}].",
            config.name,
            components.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            name: config.name.clone(),
            threshold: config.threshold,
            aggregation: config.aggregation,
            reconstruction,
            components,
            tally: PredictionTally::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tally(&self) -> &PredictionTally {
        &self.tally
    }

    /// The `[components, hours]` matrix of rubric points. Excluded hours score zero.
    pub fn hourly_points(&self, visit: &VisitState) -> Array2<u32> {
        let mut points = Array2::<u32>::zeros((self.components.len(), visit.horizon()));
        for (mut row, component) in points.axis_iter_mut(Axis(0)).zip(&self.components) {
            for (hour, cell) in row.iter_mut().enumerate() {
                if let Some(value) = component.input.reading(visit, hour, &self.reconstruction) {
                    *cell = component.bounds.score(value);
                }
            }
        }
        points
    }

    pub fn score_visit(&self, visit: &VisitState) -> VisitScore {
        let points = self.hourly_points(visit);
        let component_maxima: Vec<u32> = points
            .axis_iter(Axis(0))
            .map(|row| row.iter().copied().max().unwrap_or(0))
            .collect();
        let total = match self.aggregation {
            ScoreAggregation::ComponentMaxSum => component_maxima.iter().sum(),
            ScoreAggregation::HourlyTotalMax => points
                .sum_axis(Axis(0))
                .iter()
                .copied()
                .max()
                .unwrap_or(0),
        };
        VisitScore {
            total,
            component_maxima,
            prediction: f64::from(total) > self.threshold,
        }
    }

    /// Adds one scored visit to the running tally.
    pub fn record(&mut self, score: &VisitScore, outcome: bool) {
        self.tally.record(score.prediction, outcome);
    }
}
