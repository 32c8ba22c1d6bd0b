//! # Rule-Based Severity Scoring
//!
//! Baseline mortality predictors computed straight from the encoded timelines. Each
//! system reconstructs approximate original-unit readings from the encoded rows,
//! scores every hour against an ordered bounds rubric, aggregates across the horizon
//! and compares the total against a fixed decision threshold.

pub mod bounds;
pub mod engine;
pub mod reconstruct;
pub mod systems;

pub use bounds::{Bound, BoundAnchor, BoundsDirection, SeverityComponentBounds};
pub use engine::{
    ComponentConfig, ComponentInput, PredictionTally, ScoreAggregation, SeverityScoreEngine,
    SystemConfig, VisitScore,
};
pub use reconstruct::Reconstruction;

use crate::types::FeatureIndex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeverityError {
    #[error("Component '{component}' declares no bounds.")]
    EmptyBounds { component: String },
    #[error("Component '{component}' has {bounds} bounds but {rubric} rubric points.")]
    RubricMismatch {
        component: String,
        bounds: usize,
        rubric: usize,
    },
    #[error("Component '{component}' has a NaN bound at position {position}.")]
    NanBound { component: String, position: usize },
    #[error("Component '{component}' reads feature row {row}, but timelines have {feature_rows} rows.")]
    RowOutOfRange {
        component: String,
        row: FeatureIndex,
        feature_rows: usize,
    },
    #[error("Component '{component}' has a ratio scale of {scale}, which must be finite and non-zero.")]
    InvalidScale { component: String, scale: f64 },
}
