//! # Run Configuration
//!
//! Every tunable of an encoding run lives in `EncoderConfig`. It is deserialized from a
//! TOML file in which every field is optional; anything omitted falls back to the
//! reference constants in `Default`. The struct is validated once, before the first
//! input row is read, so that a bad configuration can never produce silently wrong
//! timelines half-way through a stream.

use crate::severity::{SystemConfig, systems};
use crate::types::{FeatureIndex, ItemId, PatientId, Split};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("horizon_hours must be at least 1")]
    EmptyHorizon,
    #[error("feature_rows must be at least 1")]
    NoFeatureRows,
    #[error("The output range [{min}, {max}] is empty or inverted.")]
    InvalidOutputRange { min: f64, max: f64 },
    #[error("The patient window [{min}, {max}] is inverted.")]
    InvertedPatientWindow { min: u64, max: u64 },
    #[error("Split fraction '{name}' = {value} must lie in [0, 1).")]
    InvalidSplitFraction { name: &'static str, value: f64 },
    #[error("batch_rows must be at least 1")]
    EmptyBatch,
    #[error("{owner} refers to feature row {row}, but only {feature_rows} rows exist.")]
    RowOutOfRange {
        owner: String,
        row: usize,
        feature_rows: usize,
    },
    #[error("Composite '{0}' declares no sub-items.")]
    EmptyComposite(String),
    #[error("Item {item} is a sub-item of more than one composite.")]
    SharedSubItem { item: ItemId },
    #[error("Scoring system '{system}' component '{component}' has {bounds} bounds but {rubric} rubric points.")]
    RubricMismatch {
        system: String,
        component: String,
        bounds: usize,
        rubric: usize,
    },
    #[error("Scoring system '{system}' component '{component}' declares no bounds.")]
    EmptyRubric { system: String, component: String },
    #[error(
        "Severity scoring reconstructs raw values by inverting the min-max encoding, which is not possible with the '{0:?}' normalization method. Disable scoring or switch to min_max."
    )]
    ReconstructionUnsupported(NormalizationMethod),
}

/// The top-level configuration for one encoding run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    /// Number of hourly columns in every timeline.
    pub horizon_hours: usize,
    /// Number of feature rows in every timeline.
    pub feature_rows: usize,
    pub output_range: OutputRange,
    /// The patient id whose rows carry the catalog instead of observations.
    pub catalog_sentinel: u64,
    /// Optional inclusive admission window on patient ids.
    pub patient_window: Option<PatientWindow>,
    /// Number of ingested rows after which the in-memory batch is flushed at the next
    /// visit boundary.
    pub batch_rows: usize,
    pub split: SplitFractions,
    pub normalization: NormalizationConfig,
    pub special: SpecialItems,
    pub composites: Vec<CompositeSpec>,
    pub scoring: ScoringConfig,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            horizon_hours: 48,
            feature_rows: 120,
            output_range: OutputRange::default(),
            catalog_sentinel: 0,
            patient_window: Some(PatientWindow {
                min: 10_000_019,
                max: 19_999_987,
            }),
            batch_rows: 10_000_000,
            split: SplitFractions::default(),
            normalization: NormalizationConfig::default(),
            special: SpecialItems::default(),
            composites: default_composites(),
            scoring: ScoringConfig::default(),
        }
    }
}

/// The closed interval every encoded value is mapped into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OutputRange {
    pub min: f64,
    pub max: f64,
}

impl Default for OutputRange {
    fn default() -> Self {
        Self { min: 0.0, max: 255.0 }
    }
}

/// An inclusive range of admitted patient ids.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatientWindow {
    pub min: u64,
    pub max: u64,
}

impl PatientWindow {
    #[inline]
    pub fn contains(&self, patient: PatientId) -> bool {
        patient.0 >= self.min && patient.0 <= self.max
    }
}

/// Fractions of each flushed batch assigned to the test and validation splits. Train
/// takes the remainder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SplitFractions {
    pub test: f64,
    pub val: f64,
}

impl Default for SplitFractions {
    fn default() -> Self {
        Self {
            test: 0.2,
            val: 0.3,
        }
    }
}

impl SplitFractions {
    /// Deterministically assigns the visit at `ordinal` (0-based, in batch insertion
    /// order) of a batch holding `count` visits.
    ///
    /// The validation split takes the tail `val` fraction of the batch, the test split
    /// takes the tail `test` fraction of what remains, and train keeps the head.
    pub fn assign(&self, ordinal: usize, count: usize) -> Split {
        let n = count as f64;
        let i = ordinal as f64;
        let test_start = n * (1.0 - self.val) * (1.0 - self.test);
        let val_start = n * (1.0 - self.val);

        if i >= val_start {
            Split::Val
        } else if i >= test_start {
            Split::Test
        } else {
            Split::Train
        }
    }
}

/// Selects how continuous observations are mapped into the output range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMethod {
    /// Linear over the observed `[min, max]` of the feature.
    MinMax,
    /// Reference-banded: values inside the reference band map to the healthy endpoint,
    /// values outside are scaled away from it.
    Reference,
    /// Linear over the event's reference band `[ref_min, ref_max]`.
    ReferenceMinMax,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizationConfig {
    pub method: NormalizationMethod,
    /// For reference-banded features, whether the healthy band maps to the low end of
    /// the output range (and deviations towards the high end) or the reverse.
    pub healthy_is_low: bool,
    /// Whether values outside the interpolation domain saturate at the range endpoints.
    pub clamp: bool,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            method: NormalizationMethod::MinMax,
            healthy_is_low: true,
            clamp: true,
        }
    }
}

/// Item identifiers that bypass ordinary point or carry-forward writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpecialItems {
    /// The item carrying the hour of day at admission.
    pub admit_hour_item: Option<ItemId>,
    /// Demographic or static flags written once across the whole row.
    pub static_items: Vec<ItemId>,
}

impl Default for SpecialItems {
    fn default() -> Self {
        Self {
            admit_hour_item: Some(ItemId(0)),
            static_items: Vec::new(),
        }
    }
}

impl SpecialItems {
    pub fn is_static(&self, item: ItemId) -> bool {
        self.static_items.contains(&item)
    }
}

/// A derived risk scale computed as the sum of several raw sub-item readings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositeSpec {
    pub name: String,
    /// The timeline row the normalized total is folded into.
    pub feature_row: FeatureIndex,
    /// The contributing items, in sub-item row order.
    pub sub_items: Vec<ItemId>,
}

fn default_composites() -> Vec<CompositeSpec> {
    vec![
        CompositeSpec {
            name: "braden".to_string(),
            feature_row: FeatureIndex(98),
            sub_items: (224_054..=224_059).map(ItemId).collect(),
        },
        CompositeSpec {
            name: "morse".to_string(),
            feature_row: FeatureIndex(107),
            sub_items: (227_341..=227_346).map(ItemId).collect(),
        },
    ]
}

/// Which rule-based severity systems run at every flush.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub enabled: bool,
    pub systems: Vec<SystemConfig>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            systems: vec![systems::early_warning(), systems::organ_failure()],
        }
    }
}

impl EncoderConfig {
    /// Loads a configuration from a TOML file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        Ok(config)
    }

    /// Checks every cross-field constraint that would otherwise corrupt encoded output.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon_hours == 0 {
            return Err(ConfigError::EmptyHorizon);
        }
        if self.feature_rows == 0 {
            return Err(ConfigError::NoFeatureRows);
        }
        if self.batch_rows == 0 {
            return Err(ConfigError::EmptyBatch);
        }

        let range = self.output_range;
        if !(range.min.is_finite() && range.max.is_finite() && range.min < range.max) {
            return Err(ConfigError::InvalidOutputRange {
                min: range.min,
                max: range.max,
            });
        }

        if let Some(window) = self.patient_window {
            if window.min > window.max {
                return Err(ConfigError::InvertedPatientWindow {
                    min: window.min,
                    max: window.max,
                });
            }
        }

        for (name, value) in [("test", self.split.test), ("val", self.split.val)] {
            if !(0.0..1.0).contains(&value) {
                return Err(ConfigError::InvalidSplitFraction { name, value });
            }
        }

        let mut seen_sub_items = ahash::AHashSet::new();
        for composite in &self.composites {
            self.check_row(&format!("Composite '{}'", composite.name), composite.feature_row)?;
            if composite.sub_items.is_empty() {
                return Err(ConfigError::EmptyComposite(composite.name.clone()));
            }
            for &item in &composite.sub_items {
                if !seen_sub_items.insert(item) {
                    return Err(ConfigError::SharedSubItem { item });
                }
            }
        }

        if self.scoring.enabled {
            if self.normalization.method != NormalizationMethod::MinMax {
                return Err(ConfigError::ReconstructionUnsupported(
                    self.normalization.method,
                ));
            }
            for system in &self.scoring.systems {
                for component in &system.components {
                    for row in component.input.rows() {
                        self.check_row(
                            &format!("Scoring component '{}/{}'", system.name, component.name),
                            row,
                        )?;
                    }
                    if component.bounds.is_empty() {
                        return Err(ConfigError::EmptyRubric {
                            system: system.name.clone(),
                            component: component.name.clone(),
                        });
                    }
                    if component.bounds.len() != component.rubric.len() {
                        return Err(ConfigError::RubricMismatch {
                            system: system.name.clone(),
                            component: component.name.clone(),
                            bounds: component.bounds.len(),
                            rubric: component.rubric.len(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    fn check_row(&self, owner: &str, row: FeatureIndex) -> Result<(), ConfigError> {
        if row.0 >= self.feature_rows {
            return Err(ConfigError::RowOutOfRange {
                owner: owner.to_string(),
                row: row.0,
                feature_rows: self.feature_rows,
            });
        }
        Ok(())
    }
}
