//! # Feature Catalog
//!
//! Static metadata that every other stage reads: which feature row each raw item
//! identifier belongs to, and the per-row statistics (variable kind, observed range,
//! reference band, default) that drive normalization and reconstruction.
//!
//! The catalog is not a side file. It travels inside the event stream itself as rows
//! tagged with the sentinel patient id, and it is assembled by `CatalogBuilder` before
//! the first ordinary event. Once frozen it is read-only and shared by reference.

use crate::types::{EventRecord, FeatureIndex, ItemId, UnknownVariableKind, VariableKind};
use ahash::AHashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog row at line {line}: {source}")]
    UnknownKind {
        line: u64,
        #[source]
        source: UnknownVariableKind,
    },
    #[error("Catalog row at line {line} targets feature row {row}, but only {feature_rows} rows exist.")]
    RowOutOfRange {
        line: u64,
        row: usize,
        feature_rows: usize,
    },
    #[error("Catalog row at line {line} for feature {row} has observed_min {min} > observed_max {max}.")]
    InvertedRange {
        line: u64,
        row: usize,
        min: f64,
        max: f64,
    },
    #[error("Catalog row at line {line} sits at hour {hour}, outside the {horizon}-hour horizon.")]
    HourOutsideHorizon { line: u64, hour: i64, horizon: usize },
    #[error("Catalog row at line {line} for feature {row} contains a non-finite statistic.")]
    NonFinite { line: u64, row: usize },
    #[error("Item {item} is mapped to feature {first} and again to feature {second} (line {line}).")]
    ConflictingItem {
        item: ItemId,
        first: FeatureIndex,
        second: FeatureIndex,
        line: u64,
    },
}

/// One row of the fixed-width statistics table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureStats {
    pub kind: VariableKind,
    /// Number of source observations the statistics were computed from.
    pub value_count: f64,
    pub observed_min: f64,
    pub observed_max: f64,
    pub reference_min: f64,
    pub reference_max: f64,
    pub default_value: f64,
}

impl FeatureStats {
    /// The all-zero row that every feature index without a catalog entry holds.
    pub const UNUSED: FeatureStats = FeatureStats {
        kind: VariableKind::Binary,
        value_count: 0.0,
        observed_min: 0.0,
        observed_max: 0.0,
        reference_min: 0.0,
        reference_max: 0.0,
        default_value: 0.0,
    };
}

/// The frozen catalog: item mapping plus the statistics table.
#[derive(Debug, Clone)]
pub struct FeatureCatalog {
    stats: Vec<FeatureStats>,
    defined: Vec<bool>,
    item_to_feature: AHashMap<ItemId, FeatureIndex>,
}

impl FeatureCatalog {
    #[inline]
    pub fn feature_for(&self, item: ItemId) -> Option<FeatureIndex> {
        self.item_to_feature.get(&item).copied()
    }

    #[inline]
    pub fn stats(&self, feature: FeatureIndex) -> &FeatureStats {
        &self.stats[feature.0]
    }

    /// Whether any catalog row defined this feature.
    #[inline]
    pub fn is_defined(&self, feature: FeatureIndex) -> bool {
        self.defined[feature.0]
    }

    pub fn feature_rows(&self) -> usize {
        self.stats.len()
    }

    pub fn item_count(&self) -> usize {
        self.item_to_feature.len()
    }

    pub fn defined_feature_count(&self) -> usize {
        self.defined.iter().filter(|&&d| d).count()
    }

    pub fn all_stats(&self) -> &[FeatureStats] {
        &self.stats
    }
}

/// Accumulates sentinel-tagged catalog rows into a `FeatureCatalog`.
#[derive(Debug)]
pub struct CatalogBuilder {
    stats: Vec<FeatureStats>,
    defined: Vec<bool>,
    item_to_feature: AHashMap<ItemId, FeatureIndex>,
    horizon: usize,
    rows_seen: u64,
}

impl CatalogBuilder {
    pub fn new(feature_rows: usize, horizon: usize) -> Self {
        Self {
            horizon,
            stats: vec![FeatureStats::UNUSED; feature_rows],
            defined: vec![false; feature_rows],
            item_to_feature: AHashMap::new(),
            rows_seen: 0,
        }
    }

    /// Absorbs one catalog row. In a catalog row the visit column carries the feature
    /// index and the outcome column is ignored. The hour column must still name a
    /// column of the horizon, or every timeline built from this catalog is suspect.
    pub fn push(&mut self, record: &EventRecord, line: u64) -> Result<(), CatalogError> {
        self.rows_seen += 1;

        if record.hour < 0 || record.hour as u64 >= self.horizon as u64 {
            return Err(CatalogError::HourOutsideHorizon {
                line,
                hour: record.hour,
                horizon: self.horizon,
            });
        }

        let row = record.visit_id.0 as usize;
        if row >= self.stats.len() {
            return Err(CatalogError::RowOutOfRange {
                line,
                row,
                feature_rows: self.stats.len(),
            });
        }

        let kind = VariableKind::from_code(record.kind_code)
            .map_err(|source| CatalogError::UnknownKind { line, source })?;

        let stats = FeatureStats {
            kind,
            value_count: record.value,
            observed_min: record.observed_min,
            observed_max: record.observed_max,
            reference_min: record.reference_min,
            reference_max: record.reference_max,
            default_value: record.default_value,
        };

        let finite = [
            stats.value_count,
            stats.observed_min,
            stats.observed_max,
            stats.reference_min,
            stats.reference_max,
            stats.default_value,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(CatalogError::NonFinite { line, row });
        }
        if stats.observed_min > stats.observed_max {
            return Err(CatalogError::InvertedRange {
                line,
                row,
                min: stats.observed_min,
                max: stats.observed_max,
            });
        }

        let feature = FeatureIndex(row);
        match self.item_to_feature.get(&record.item_id) {
            Some(&first) if first != feature => {
                return Err(CatalogError::ConflictingItem {
                    item: record.item_id,
                    first,
                    second: feature,
                    line,
                });
            }
            Some(_) => {}
            None => {
                self.item_to_feature.insert(record.item_id, feature);
            }
        }

        if !self.defined[row] {
            self.stats[row] = stats;
            self.defined[row] = true;
        } else if self.stats[row] != stats {
            log::warn!(
                "Catalog line {line}: feature {row} already has statistics; keeping the first definition and ignoring this one."
            );
        }

        Ok(())
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    pub fn finish(self) -> FeatureCatalog {
        FeatureCatalog {
            stats: self.stats,
            defined: self.defined,
            item_to_feature: self.item_to_feature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PatientId, VisitId};

    fn catalog_row(row: u64, item: u64, kind: f64, min: f64, max: f64, default: f64) -> EventRecord {
        EventRecord {
            patient_id: PatientId(0),
            visit_id: VisitId(row),
            item_id: ItemId(item),
            hour: 0,
            kind_code: kind,
            value: 100.0,
            observed_min: min,
            observed_max: max,
            reference_min: min,
            reference_max: max,
            default_value: default,
            outcome: false,
        }
    }

    #[test]
    fn many_items_share_one_feature() {
        let mut builder = CatalogBuilder::new(4, 4);
        builder.push(&catalog_row(2, 211, 1.0, 0.0, 300.0, 80.0), 1).unwrap();
        builder.push(&catalog_row(2, 220045, 1.0, 0.0, 300.0, 80.0), 2).unwrap();
        let catalog = builder.finish();

        assert_eq!(catalog.feature_for(ItemId(211)), Some(FeatureIndex(2)));
        assert_eq!(catalog.feature_for(ItemId(220045)), Some(FeatureIndex(2)));
        assert_eq!(catalog.feature_for(ItemId(9)), None);
        assert_eq!(catalog.item_count(), 2);
        assert_eq!(catalog.defined_feature_count(), 1);
        assert_eq!(catalog.stats(FeatureIndex(2)).kind, VariableKind::Continuous);
    }

    #[test]
    fn unused_rows_stay_all_zero() {
        let mut builder = CatalogBuilder::new(3, 4);
        builder.push(&catalog_row(1, 5, 1.0, 0.0, 10.0, 0.0), 1).unwrap();
        let catalog = builder.finish();

        assert!(!catalog.is_defined(FeatureIndex(0)));
        assert_eq!(*catalog.stats(FeatureIndex(0)), FeatureStats::UNUSED);
        assert_eq!(*catalog.stats(FeatureIndex(2)), FeatureStats::UNUSED);
    }

    #[test]
    fn duplicate_feature_definition_keeps_the_first() {
        let mut builder = CatalogBuilder::new(2, 4);
        builder.push(&catalog_row(1, 5, 1.0, 0.0, 10.0, 0.0), 1).unwrap();
        builder.push(&catalog_row(1, 6, 1.0, -5.0, 50.0, 1.0), 2).unwrap();
        let catalog = builder.finish();

        assert_eq!(catalog.stats(FeatureIndex(1)).observed_max, 10.0);
        assert_eq!(catalog.feature_for(ItemId(6)), Some(FeatureIndex(1)));
    }

    #[test]
    fn malformed_rows_are_fatal() {
        let mut builder = CatalogBuilder::new(2, 4);
        assert!(matches!(
            builder.push(&catalog_row(7, 5, 1.0, 0.0, 10.0, 0.0), 3),
            Err(CatalogError::RowOutOfRange { line: 3, row: 7, .. })
        ));
        assert!(matches!(
            builder.push(&catalog_row(1, 5, 9.0, 0.0, 10.0, 0.0), 4),
            Err(CatalogError::UnknownKind { line: 4, .. })
        ));
        assert!(matches!(
            builder.push(&catalog_row(1, 5, 1.0, 10.0, 0.0, 0.0), 5),
            Err(CatalogError::InvertedRange { .. })
        ));
        assert!(matches!(
            builder.push(&catalog_row(1, 5, 1.0, 0.0, f64::NAN, 0.0), 6),
            Err(CatalogError::NonFinite { .. })
        ));
    }

    #[test]
    fn catalog_rows_must_sit_inside_the_horizon() {
        let mut builder = CatalogBuilder::new(3, 4);
        let mut late = catalog_row(1, 5, 1.0, 0.0, 10.0, 0.0);
        late.hour = 4;
        assert!(matches!(
            builder.push(&late, 7),
            Err(CatalogError::HourOutsideHorizon { line: 7, hour: 4, horizon: 4 })
        ));
        late.hour = -1;
        assert!(matches!(
            builder.push(&late, 8),
            Err(CatalogError::HourOutsideHorizon { hour: -1, .. })
        ));

        late.hour = 3;
        builder.push(&late, 9).unwrap();
        let catalog = builder.finish();
        assert_eq!(catalog.feature_for(ItemId(5)), Some(FeatureIndex(1)));
    }

    #[test]
    fn one_item_cannot_map_to_two_features() {
        let mut builder = CatalogBuilder::new(3, 4);
        builder.push(&catalog_row(0, 5, 1.0, 0.0, 10.0, 0.0), 1).unwrap();
        let err = builder.push(&catalog_row(1, 5, 1.0, 0.0, 10.0, 0.0), 2).unwrap_err();
        match err {
            CatalogError::ConflictingItem { first, second, .. } => {
                assert_eq!(first, FeatureIndex(0));
                assert_eq!(second, FeatureIndex(1));
            }
            other => panic!("Expected ConflictingItem, got {other:?}"),
        }
        assert_eq!(builder.rows_seen(), 2);
    }
}
