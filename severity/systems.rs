//! The two built-in scoring systems, expressed as plain configuration so a TOML file can
//! replace either one wholesale.

use super::bounds::{Bound, BoundAnchor, BoundsDirection};
use super::engine::{ComponentConfig, ComponentInput, ScoreAggregation, SystemConfig};
use crate::types::FeatureIndex;

pub const EARLY_WARNING_THRESHOLD: f64 = 2.9;
pub const ORGAN_FAILURE_THRESHOLD: f64 = 5.2;

/// Points for the early-warning ladder: worst at both ends, zero in the middle.
const LADDER_RUBRIC: [u32; 7] = [3, 2, 1, 0, 1, 2, 3];
/// Points for the four-step organ-failure tables, worst first.
const ORGAN_RUBRIC: [u32; 4] = [4, 3, 2, 1];

const MIN: Bound = Bound::Anchor(BoundAnchor::ObservedMin);
const MAX: Bound = Bound::Anchor(BoundAnchor::ObservedMax);

fn v(value: f64) -> Bound {
    Bound::Value(value)
}

fn feature(row: usize) -> ComponentInput {
    ComponentInput::Feature {
        feature: FeatureIndex(row),
    }
}

fn component(
    name: &str,
    input: ComponentInput,
    direction: BoundsDirection,
    bounds: Vec<Bound>,
    rubric: &[u32],
) -> ComponentConfig {
    ComponentConfig {
        name: name.to_string(),
        input,
        direction,
        bounds,
        rubric: rubric.to_vec(),
    }
}

/// Modified early-warning score over four bedside vitals.
pub fn early_warning() -> SystemConfig {
    use BoundsDirection::Ascending;
    SystemConfig {
        name: "early_warning".to_string(),
        threshold: EARLY_WARNING_THRESHOLD,
        aggregation: ScoreAggregation::ComponentMaxSum,
        components: vec![
            component(
                "respiratory_rate",
                feature(9),
                Ascending,
                vec![MIN, v(8.0), v(9.0), v(15.0), v(21.0), v(30.0), MAX],
                &LADDER_RUBRIC,
            ),
            component(
                "heart_rate",
                feature(8),
                Ascending,
                vec![MIN, v(40.0), v(51.0), v(101.0), v(111.0), v(129.0), MAX],
                &LADDER_RUBRIC,
            ),
            component(
                "systolic_pressure",
                feature(10),
                Ascending,
                vec![v(70.0), v(81.0), v(101.0), v(200.0), v(201.0), MAX, MAX],
                &LADDER_RUBRIC,
            ),
            component(
                "temperature",
                feature(7),
                Ascending,
                vec![MIN, v(35.0), v(36.1), v(38.1), v(38.6), MAX, MAX],
                &LADDER_RUBRIC,
            ),
        ],
    }
}

/// Sequential organ-failure assessment over six organ systems.
pub fn organ_failure() -> SystemConfig {
    use BoundsDirection::{Ascending, Descending};
    SystemConfig {
        name: "organ_failure".to_string(),
        threshold: ORGAN_FAILURE_THRESHOLD,
        aggregation: ScoreAggregation::ComponentMaxSum,
        components: vec![
            component(
                "respiration",
                ComponentInput::Ratio {
                    numerator: FeatureIndex(41),
                    denominator: FeatureIndex(12),
                    scale: 0.01,
                },
                Ascending,
                vec![v(100.0), v(200.0), v(300.0), v(400.0)],
                &ORGAN_RUBRIC,
            ),
            component(
                "coagulation",
                feature(60),
                Ascending,
                vec![v(20.0), v(50.0), v(100.0), v(150.0)],
                &ORGAN_RUBRIC,
            ),
            component(
                "liver",
                feature(50),
                Descending,
                vec![v(12.0), v(5.9), v(1.9), v(1.1)],
                &ORGAN_RUBRIC,
            ),
            component("cardiovascular", feature(11), Ascending, vec![v(70.0)], &[1]),
            component(
                "neurological",
                feature(14),
                Ascending,
                vec![v(6.0), v(10.0), v(13.0), v(15.0)],
                &ORGAN_RUBRIC,
            ),
            component(
                "renal",
                feature(30),
                Descending,
                vec![v(4.9), v(3.4), v(1.9), v(1.1)],
                &ORGAN_RUBRIC,
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogBuilder, FeatureCatalog};
    use crate::config::{NormalizationConfig, OutputRange};
    use crate::normalize::Normalizer;
    use crate::severity::{PredictionTally, SeverityScoreEngine};
    use crate::types::{EventRecord, ItemId, PatientId, VariableKind, VisitId};
    use crate::visit::{VisitSeed, VisitState};

    const TEMPERATURE: usize = 7;
    const HEART: usize = 8;
    const RESP: usize = 9;
    const SYSTOLIC: usize = 10;
    const GCS: usize = 14;
    const FIO2: usize = 12;
    const PAO2: usize = 41;
    const BILIRUBIN: usize = 50;

    /// `(row, observed_min, observed_max, default)` for every row either system reads.
    const CHARTED: [(usize, f64, f64, f64); 11] = [
        (TEMPERATURE, 25.0, 45.0, 37.0),
        (HEART, 0.0, 300.0, 80.0),
        (RESP, 0.0, 60.0, 16.0),
        (SYSTOLIC, 0.0, 300.0, 120.0),
        (11, 0.0, 200.0, 90.0),
        (FIO2, 0.0, 100.0, 21.0),
        (GCS, 3.0, 15.0, 15.0),
        (30, 0.0, 20.0, 1.0),
        (PAO2, 0.0, 600.0, 100.0),
        (BILIRUBIN, 0.0, 40.0, 1.0),
        (60, 0.0, 1000.0, 200.0),
    ];

    struct Ward {
        catalog: FeatureCatalog,
        normalizer: Normalizer,
        seed: VisitSeed,
    }

    impl Ward {
        fn new() -> Self {
            let mut builder = CatalogBuilder::new(120, 4);
            for (line, &(row, min, max, default)) in CHARTED.iter().enumerate() {
                let record = EventRecord {
                    patient_id: PatientId(0),
                    visit_id: VisitId(row as u64),
                    item_id: ItemId(1_000 + row as u64),
                    hour: 0,
                    kind_code: 1.0,
                    value: 1.0,
                    observed_min: min,
                    observed_max: max,
                    reference_min: min,
                    reference_max: max,
                    default_value: default,
                    outcome: false,
                };
                builder.push(&record, line as u64 + 2).unwrap();
            }
            let catalog = builder.finish();
            let normalizer = Normalizer::new(&NormalizationConfig::default(), OutputRange::default());
            let seed = VisitSeed::new(normalizer.seed_column(&catalog), Vec::new(), 4);
            Self {
                catalog,
                normalizer,
                seed,
            }
        }

        fn visit(&self, outcome: bool, charted: &[(usize, usize, f64)]) -> VisitState {
            let mut visit = VisitState::new(PatientId(10), VisitId(1), outcome, 0, &self.seed);
            for &(row, hour, raw) in charted {
                let stats = self.catalog.stats(FeatureIndex(row));
                let encoded = self.normalizer.normalize(
                    raw,
                    VariableKind::Continuous,
                    stats,
                    stats.reference_min,
                    stats.reference_max,
                );
                visit.write_point(FeatureIndex(row), hour, encoded);
            }
            visit
        }

        fn engine(&self, system: &SystemConfig) -> SeverityScoreEngine {
            SeverityScoreEngine::build(system, &self.catalog, &self.seed, OutputRange::default())
                .unwrap()
        }
    }

    #[test]
    fn early_warning_sums_the_worst_hour_of_each_vital() {
        let ward = Ward::new();
        let engine = ward.engine(&early_warning());
        // resp 35 -> 3, heart 45 -> 1, systolic 75 -> 2, temperature 36.5 -> 0
        let visit = ward.visit(
            true,
            &[(RESP, 0, 35.0), (HEART, 1, 45.0), (SYSTOLIC, 2, 75.0), (TEMPERATURE, 3, 36.5)],
        );
        let score = engine.score_visit(&visit);
        assert_eq!(score.component_maxima, vec![3, 1, 2, 0]);
        assert_eq!(score.total, 6);
        assert!(score.prediction);
    }

    #[test]
    fn early_warning_threshold_is_strict() {
        let ward = Ward::new();
        let mut engine = ward.engine(&early_warning());
        let outcomes = [
            (ward.visit(true, &[(RESP, 0, 35.0)]), true),
            (ward.visit(true, &[(SYSTOLIC, 0, 75.0)]), true),
            (ward.visit(false, &[(HEART, 0, 135.0)]), false),
            (ward.visit(false, &[]), false),
        ];
        let mut totals = Vec::new();
        for (visit, outcome) in &outcomes {
            let score = engine.score_visit(visit);
            totals.push(score.total);
            engine.record(&score, *outcome);
        }
        assert_eq!(totals, vec![3, 2, 3, 0]);
        assert_eq!(
            *engine.tally(),
            PredictionTally {
                true_positive: 1,
                false_positive: 1,
                true_negative: 1,
                false_negative: 1,
            }
        );
    }

    #[test]
    fn organ_failure_ratio_needs_both_rows_charted() {
        let ward = Ward::new();
        let engine = ward.engine(&organ_failure());

        // 90 / (50 * 0.01) = 180 -> 3 points
        let both = ward.visit(false, &[(PAO2, 1, 90.0), (FIO2, 1, 50.0)]);
        assert_eq!(engine.score_visit(&both).component_maxima[0], 3);

        let pao2_only = ward.visit(false, &[(PAO2, 1, 90.0)]);
        assert_eq!(engine.score_visit(&pao2_only).component_maxima[0], 0);

        let fio2_only = ward.visit(false, &[(FIO2, 1, 50.0)]);
        assert_eq!(engine.score_visit(&fio2_only).component_maxima[0], 0);

        let staggered = ward.visit(false, &[(PAO2, 0, 90.0), (FIO2, 1, 50.0)]);
        assert_eq!(engine.score_visit(&staggered).component_maxima[0], 0);
    }

    #[test]
    fn organ_failure_bilirubin_scores_descending() {
        let ward = Ward::new();
        let engine = ward.engine(&organ_failure());
        let liver = |raw: f64| {
            engine
                .score_visit(&ward.visit(false, &[(BILIRUBIN, 0, raw)]))
                .component_maxima[2]
        };
        assert_eq!(liver(15.0), 4);
        assert_eq!(liver(7.0), 3);
        assert_eq!(liver(3.0), 2);
        assert_eq!(liver(1.5), 1);
        assert_eq!(liver(0.8), 0);
    }

    #[test]
    fn organ_failure_predicts_above_five_point_two() {
        let ward = Ward::new();
        let mut engine = ward.engine(&organ_failure());

        // respiration 3 + liver 3 = 6
        let severe = ward.visit(true, &[(PAO2, 0, 90.0), (FIO2, 0, 50.0), (BILIRUBIN, 2, 7.0)]);
        // respiration 3 + liver 1 + neurological 1 = 5
        let borderline = ward.visit(
            true,
            &[(PAO2, 0, 90.0), (FIO2, 0, 50.0), (BILIRUBIN, 1, 1.5), (GCS, 3, 14.0)],
        );

        let severe_score = engine.score_visit(&severe);
        let borderline_score = engine.score_visit(&borderline);
        assert_eq!(severe_score.total, 6);
        assert!(severe_score.prediction);
        assert_eq!(borderline_score.total, 5);
        assert!(!borderline_score.prediction);

        engine.record(&severe_score, true);
        engine.record(&borderline_score, true);
        assert_eq!(engine.tally().true_positive, 1);
        assert_eq!(engine.tally().false_negative, 1);
    }

    #[test]
    fn built_in_rubrics_are_well_formed() {
        for system in [early_warning(), organ_failure()] {
            for c in &system.components {
                assert_eq!(c.bounds.len(), c.rubric.len(), "{}/{}", system.name, c.name);
                assert!(c.input.rows().iter().all(|row| row.0 < 120));
            }
        }
    }

    #[test]
    fn early_warning_reads_the_four_vitals() {
        let system = early_warning();
        let rows: Vec<usize> = system
            .components
            .iter()
            .flat_map(|c| c.input.rows())
            .map(|r| r.0)
            .collect();
        assert_eq!(rows, vec![9, 8, 10, 7]);
        assert_eq!(system.threshold, 2.9);
    }

    #[test]
    fn organ_failure_respiration_is_a_scaled_ratio() {
        let system = organ_failure();
        assert_eq!(system.components.len(), 6);
        assert_eq!(
            system.components[0].input,
            ComponentInput::Ratio {
                numerator: FeatureIndex(41),
                denominator: FeatureIndex(12),
                scale: 0.01,
            }
        );
        assert_eq!(system.components[2].direction, BoundsDirection::Descending);
        assert_eq!(system.threshold, 5.2);
    }

    #[test]
    fn built_in_systems_survive_a_toml_round_trip() {
        let system = organ_failure();
        let text = toml::to_string(&system).unwrap();
        let back: SystemConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, system);
    }
}
