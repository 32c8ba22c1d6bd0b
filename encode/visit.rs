//! # Visit State
//!
//! The mutable, in-memory encoding of one hospital visit while its batch is live: the
//! `[feature_rows, horizon_hours]` timeline plus one raw sub-item matrix per composite
//! scale. A visit is created on its first event, mutated by every later event for it,
//! and consumed exactly once when its batch is flushed.

use crate::types::{FeatureIndex, PatientId, VisitId, VisitKey};
use ahash::AHashSet;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};

/// The seeded contents every fresh visit starts from, computed once per run.
#[derive(Debug, Clone)]
pub struct VisitSeed {
    /// Encoded default of every feature row.
    timeline: Array1<f64>,
    /// Raw default of every sub-item, one column per composite.
    composites: Vec<Array1<f64>>,
    horizon: usize,
}

impl VisitSeed {
    pub fn new(timeline: Array1<f64>, composites: Vec<Array1<f64>>, horizon: usize) -> Self {
        Self {
            timeline,
            composites,
            horizon,
        }
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn feature_rows(&self) -> usize {
        self.timeline.len()
    }

    /// The seeded encoding of one feature row.
    #[inline]
    pub fn encoded_default(&self, row: FeatureIndex) -> f64 {
        self.timeline[row.0]
    }

    pub fn timeline_column(&self) -> ArrayView1<'_, f64> {
        self.timeline.view()
    }
}

fn broadcast_column(column: &Array1<f64>, horizon: usize) -> Array2<f64> {
    Array2::from_shape_fn((column.len(), horizon), |(row, _)| column[row])
}

#[derive(Debug, Clone)]
pub struct VisitState {
    patient_id: PatientId,
    visit_id: VisitId,
    outcome: bool,
    /// How many earlier incarnations of this visit id were already flushed in this run.
    generation: u32,
    timeline: Array2<f64>,
    composites: Vec<Array2<f64>>,
    static_rows: AHashSet<FeatureIndex>,
}

impl VisitState {
    pub fn new(
        patient_id: PatientId,
        visit_id: VisitId,
        outcome: bool,
        generation: u32,
        seed: &VisitSeed,
    ) -> Self {
        Self {
            patient_id,
            visit_id,
            outcome,
            generation,
            timeline: broadcast_column(&seed.timeline, seed.horizon),
            composites: seed
                .composites
                .iter()
                .map(|column| broadcast_column(column, seed.horizon))
                .collect(),
            static_rows: AHashSet::new(),
        }
    }

    pub fn patient_id(&self) -> PatientId {
        self.patient_id
    }

    pub fn visit_id(&self) -> VisitId {
        self.visit_id
    }

    pub fn key(&self) -> VisitKey {
        VisitKey::new(self.patient_id, self.visit_id)
    }

    pub fn outcome(&self) -> bool {
        self.outcome
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn horizon(&self) -> usize {
        self.timeline.ncols()
    }

    pub fn timeline(&self) -> ArrayView2<'_, f64> {
        self.timeline.view()
    }

    pub fn row(&self, row: FeatureIndex) -> ArrayView1<'_, f64> {
        self.timeline.row(row.0)
    }

    pub fn composite(&self, index: usize) -> ArrayView2<'_, f64> {
        self.composites[index].view()
    }

    /// Writes `value` at `hour` and every later hour of the row.
    #[inline]
    pub fn write_carry_forward(&mut self, row: FeatureIndex, hour: usize, value: f64) {
        self.timeline.slice_mut(s![row.0, hour..]).fill(value);
    }

    /// Writes `value` at exactly one hour of the row.
    #[inline]
    pub fn write_point(&mut self, row: FeatureIndex, hour: usize, value: f64) {
        self.timeline[[row.0, hour]] = value;
    }

    /// Replaces the whole row with `values`, which must span the horizon.
    pub fn replace_row(&mut self, row: FeatureIndex, values: ArrayView1<'_, f64>) {
        self.timeline.row_mut(row.0).assign(&values);
    }

    /// Fills the whole row with a constant, at most once per row for the visit's
    /// lifetime. Returns whether the write happened.
    pub fn fill_row_once(&mut self, row: FeatureIndex, value: f64) -> bool {
        if !self.static_rows.insert(row) {
            return false;
        }
        self.timeline.row_mut(row.0).fill(value);
        true
    }

    /// Records a raw sub-item reading for a composite scale at one hour.
    #[inline]
    pub fn record_sub_item(&mut self, composite: usize, sub_item: usize, hour: usize, raw: f64) {
        self.composites[composite][[sub_item, hour]] = raw;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn seed() -> VisitSeed {
        VisitSeed::new(
            array![0.0, 127.5, 255.0],
            vec![array![1.0, 2.0], array![0.0]],
            4,
        )
    }

    fn visit() -> VisitState {
        VisitState::new(PatientId(10), VisitId(20), true, 0, &seed())
    }

    #[test]
    fn fresh_visit_rows_equal_their_seeded_default() {
        let v = visit();
        assert_eq!(v.timeline().dim(), (3, 4));
        for (row, expected) in [0.0, 127.5, 255.0].into_iter().enumerate() {
            assert!(v.row(FeatureIndex(row)).iter().all(|&x| x == expected));
        }
        assert_eq!(v.composite(0), array![[1.0, 1.0, 1.0, 1.0], [2.0, 2.0, 2.0, 2.0]]);
        assert_eq!(v.composite(1).dim(), (1, 4));
        assert!(v.outcome());
    }

    #[test]
    fn carry_forward_fills_to_the_end_of_the_horizon() {
        let mut v = visit();
        v.write_carry_forward(FeatureIndex(0), 1, 50.0);
        assert_eq!(v.row(FeatureIndex(0)), array![0.0, 50.0, 50.0, 50.0]);

        v.write_carry_forward(FeatureIndex(0), 3, 70.0);
        assert_eq!(v.row(FeatureIndex(0)), array![0.0, 50.0, 50.0, 70.0]);
    }

    #[test]
    fn point_write_touches_one_column() {
        let mut v = visit();
        v.write_point(FeatureIndex(1), 2, 9.0);
        assert_eq!(v.row(FeatureIndex(1)), array![127.5, 127.5, 9.0, 127.5]);
        assert_eq!(v.row(FeatureIndex(0)), array![0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn static_rows_are_written_once() {
        let mut v = visit();
        assert!(v.fill_row_once(FeatureIndex(2), 3.0));
        assert!(!v.fill_row_once(FeatureIndex(2), 4.0));
        assert_eq!(v.row(FeatureIndex(2)), array![3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn sub_item_records_do_not_carry_forward() {
        let mut v = visit();
        v.record_sub_item(0, 1, 1, 4.0);
        assert_eq!(v.composite(0).row(1), array![2.0, 4.0, 2.0, 2.0]);
    }
}
