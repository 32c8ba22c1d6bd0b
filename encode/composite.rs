//! # Composite Score Tally
//!
//! Some timeline rows are not observed directly. They are derived risk scales (pressure
//! injury and fall risk in the default configuration) whose value is the sum of several
//! separately charted sub-items. Ingestion records the raw sub-item readings per hour
//! into the visit's composite matrices; this module folds those matrices back into the
//! main timeline once per flushed batch.

use crate::catalog::FeatureCatalog;
use crate::config::CompositeSpec;
use crate::normalize::Normalizer;
use crate::types::{FeatureIndex, ItemId};
use crate::visit::VisitState;
use ahash::AHashMap;
use ndarray::{Array1, ArrayView2};

#[derive(Debug, Clone)]
struct CompositeScale {
    name: String,
    feature_row: FeatureIndex,
    /// Raw default of each sub-item, in sub-item row order.
    seed: Array1<f64>,
    /// Hourly total of an untouched visit.
    baseline: f64,
}

/// Sums in row order so that totals and baselines round identically.
#[inline]
fn ordered_sum(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0, |acc, v| acc + v)
}

fn hourly_total(matrix: &ArrayView2<'_, f64>, hour: usize) -> f64 {
    ordered_sum(matrix.column(hour).iter().copied())
}

/// Resolves sub-items to their composite and folds composite totals into timelines.
#[derive(Debug, Clone)]
pub struct CompositeTally {
    scales: Vec<CompositeScale>,
    sub_items: AHashMap<ItemId, (usize, usize)>,
}

impl CompositeTally {
    pub fn new(specs: &[CompositeSpec], catalog: &FeatureCatalog) -> Self {
        let mut sub_items = AHashMap::new();
        let scales = specs
            .iter()
            .enumerate()
            .map(|(composite, spec)| {
                let seed: Array1<f64> = spec
                    .sub_items
                    .iter()
                    .enumerate()
                    .map(|(sub_item, &item)| {
                        sub_items.insert(item, (composite, sub_item));
                        match catalog.feature_for(item) {
                            Some(feature) => catalog.stats(feature).default_value,
                            None => {
                                log::warn!(
                                    "Composite '{}' sub-item {item} is not in the catalog; its readings will never be recorded.",
                                    spec.name
                                );
                                0.0
                            }
                        }
                    })
                    .collect();
                let baseline = ordered_sum(seed.iter().copied());
                if !catalog.is_defined(spec.feature_row) {
                    log::warn!(
                        "Composite '{}' folds into feature row {}, which has no catalog statistics.",
                        spec.name,
                        spec.feature_row
                    );
                }
                CompositeScale {
                    name: spec.name.clone(),
                    feature_row: spec.feature_row,
                    seed,
                    baseline,
                }
            })
            .collect();

        Self { scales, sub_items }
    }

    /// The raw default columns a fresh visit's composite matrices are seeded from.
    pub fn seed_columns(&self) -> Vec<Array1<f64>> {
        self.scales.iter().map(|scale| scale.seed.clone()).collect()
    }

    /// The `(composite, sub_item)` slot an item records into, if it is a sub-item.
    #[inline]
    pub fn locate(&self, item: ItemId) -> Option<(usize, usize)> {
        self.sub_items.get(&item).copied()
    }

    pub fn len(&self) -> usize {
        self.scales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }

    pub fn name(&self, composite: usize) -> &str {
        &self.scales[composite].name
    }

    /// Recomputes every composite of one visit and folds the totals into its timeline.
    ///
    /// Hours whose raw total equals the untouched baseline initiate no write, so a visit
    /// that never charted a sub-item keeps its seeded default row. Every other hour
    /// writes its normalized total with carry-forward, in hour order, so the latest
    /// differing hour wins for all later columns.
    pub fn tally(&self, visit: &mut VisitState, normalizer: &Normalizer, catalog: &FeatureCatalog) {
        for (index, scale) in self.scales.iter().enumerate() {
            let stats = catalog.stats(scale.feature_row);
            let horizon = visit.horizon();
            let mut writes = Vec::new();
            {
                let matrix = visit.composite(index);
                for hour in 0..horizon {
                    let total = hourly_total(&matrix, hour);
                    if total != scale.baseline {
                        writes.push((hour, total));
                    }
                }
            }
            for (hour, total) in writes {
                let encoded = normalizer.normalize(
                    total,
                    stats.kind,
                    stats,
                    stats.reference_min,
                    stats.reference_max,
                );
                visit.write_carry_forward(scale.feature_row, hour, encoded);
            }
        }
    }

    pub fn tally_batch<'a>(
        &self,
        visits: impl IntoIterator<Item = &'a mut VisitState>,
        normalizer: &Normalizer,
        catalog: &FeatureCatalog,
    ) {
        for visit in visits {
            self.tally(visit, normalizer, catalog);
        }
    }
}
