// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// Identifiers and records that cross module boundaries. Types private to one stage
// live with that stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The measurement semantics of a feature row. The discriminants are the codes used in
/// the catalog bootstrap rows and in every event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Binary,
    Continuous,
    ContinuousWithReference,
    ContinuousCumulative,
    BinaryPoint,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("'{0}' is not a known variable kind code (expected an integral value in 0..=4)")]
pub struct UnknownVariableKind(pub String);

impl VariableKind {
    /// Decodes the numeric kind code. Codes may be spelled as integers or as integral
    /// decimals ("2" and "2.0" are both accepted).
    pub fn from_code(code: f64) -> Result<Self, UnknownVariableKind> {
        if code.fract() != 0.0 {
            return Err(UnknownVariableKind(code.to_string()));
        }
        match code as i64 {
            0 => Ok(Self::Binary),
            1 => Ok(Self::Continuous),
            2 => Ok(Self::ContinuousWithReference),
            3 => Ok(Self::ContinuousCumulative),
            4 => Ok(Self::BinaryPoint),
            _ => Err(UnknownVariableKind(code.to_string())),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Binary => 0,
            Self::Continuous => 1,
            Self::ContinuousWithReference => 2,
            Self::ContinuousCumulative => 3,
            Self::BinaryPoint => 4,
        }
    }

    /// Point kinds write a single hour; every other kind carries forward.
    #[inline]
    pub fn is_point(self) -> bool {
        matches!(self, Self::BinaryPoint)
    }
}

/// The dataset partition a flushed visit is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Split {
    Train,
    Test,
    Val,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Test, Split::Val];

    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
            Split::Val => "val",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed row of the input stream, in the fixed column order of the event format.
/// Catalog bootstrap rows share this shape; for them `visit_id` carries the feature index.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub patient_id: PatientId,
    pub visit_id: VisitId,
    pub item_id: ItemId,
    pub hour: i64,
    pub kind_code: f64,
    pub value: f64,
    pub observed_min: f64,
    pub observed_max: f64,
    pub reference_min: f64,
    pub reference_max: f64,
    pub default_value: f64,
    pub outcome: bool,
}

impl EventRecord {
    #[inline]
    pub fn visit_key(&self) -> VisitKey {
        VisitKey::new(self.patient_id, self.visit_id)
    }
}

/// The number of columns every input row must carry.
pub const EVENT_COLUMN_COUNT: usize = 12;

/// Header names of the event format, in column order.
pub const EVENT_COLUMNS: [&str; EVENT_COLUMN_COUNT] = [
    "patient_id",
    "visit_id",
    "item_id",
    "hour",
    "variable_kind",
    "val_num",
    "val_min",
    "val_max",
    "ref_min",
    "ref_max",
    "default",
    "outcome_flag",
];

// ========================================================================================
//                            Primitive Type Definitions
// ========================================================================================

/// A patient identifier from the source extract.
///
/// These newtypes keep the several integer id spaces of an event row from being
/// confused with one another. `#[repr(transparent)]` keeps them zero-cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PatientId(pub u64);

/// A hospital admission identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VisitId(pub u64);

/// A visit as the stream addresses it. Visit ids are only required to be unique
/// within one patient, so every per-visit lookup is keyed on the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VisitKey {
    pub patient: PatientId,
    pub visit: VisitId,
}

impl VisitKey {
    pub const fn new(patient: PatientId, visit: VisitId) -> Self {
        Self { patient, visit }
    }
}

/// A raw item identifier, as charted by the source system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ItemId(pub u64);

/// A dense row index into the timeline matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct FeatureIndex(pub usize);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VisitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.patient.0, self.visit.0)
    }
}

impl fmt::Display for FeatureIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
