// ========================================================================================
//
//                               THE EVENT INGESTER
//
// ========================================================================================
//
// ### Purpose ###
//
// This module turns the raw, row-per-observation event stream into per-visit timeline
// mutations. It owns three responsibilities:
//
// 1.  Parsing: reading the fixed twelve-column CSV format (optionally gzip
//     compressed) into typed `EventRecord`s, with line-accurate errors.
// 2.  Filtering: sentinel rows, out-of-window patients, out-of-horizon hours and
//     unmapped items are skipped and counted, never raised.
// 3.  Routing: each surviving event is encoded and written into the `VisitState`
//     it belongs to, honoring the write policy of its variable kind and the special
//     handling of reserved item identifiers.

use crate::catalog::FeatureCatalog;
use crate::composite::CompositeTally;
use crate::config::{EncoderConfig, PatientWindow, SpecialItems};
use crate::normalize::Normalizer;
use crate::types::{
    EVENT_COLUMN_COUNT, EVENT_COLUMNS, EventRecord, FeatureIndex, ItemId, PatientId, UnknownVariableKind,
    VariableKind, VisitId, VisitKey,
};
use crate::visit::{VisitSeed, VisitState};
use ahash::{AHashMap, AHashSet};
use flate2::read::MultiGzDecoder;
use ndarray::Array1;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Hours in a day; the admission hour-of-day row cycles with this period.
const HOURS_PER_DAY: usize = 24;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("I/O error reading the event stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error reading the event stream: {0}")]
    Csv(#[from] csv::Error),
    #[error("Malformed event row at line {line}: {message}")]
    MalformedRecord { line: u64, message: String },
    #[error("Event row at line {line}: {source}")]
    UnknownKind {
        line: u64,
        #[source]
        source: UnknownVariableKind,
    },
}

// ========================================================================================
//                                   Stream parsing
// ========================================================================================

fn field<'r>(record: &'r csv::StringRecord, index: usize) -> &'r str {
    record.get(index).unwrap_or("")
}

/// Largest magnitude at which every integer is exactly representable as an `f64`.
const EXACT_INTEGER_LIMIT: f64 = 9_007_199_254_740_992.0;

/// Integers may be spelled as integral decimals ("20" and "20.0" are both accepted).
fn parse_i64(record: &csv::StringRecord, index: usize, line: u64) -> Result<i64, IngestError> {
    let (name, text) = (EVENT_COLUMNS[index], field(record, index));
    text.parse::<i64>()
        .ok()
        .or_else(|| {
            text.parse::<f64>()
                .ok()
                .filter(|v| v.fract() == 0.0 && v.abs() <= EXACT_INTEGER_LIMIT)
                .map(|v| v as i64)
        })
        .ok_or_else(|| IngestError::MalformedRecord {
            line,
            message: format!("column '{name}' must be an integer, found '{text}'"),
        })
}

fn parse_u64(record: &csv::StringRecord, index: usize, line: u64) -> Result<u64, IngestError> {
    let value = parse_i64(record, index, line)?;
    u64::try_from(value).map_err(|_| IngestError::MalformedRecord {
        line,
        message: format!("column '{}' must not be negative, found {value}", EVENT_COLUMNS[index]),
    })
}

/// NaN and the infinities parse as `f64` but are never valid measurements.
fn parse_f64(record: &csv::StringRecord, index: usize, line: u64) -> Result<f64, IngestError> {
    let (name, text) = (EVENT_COLUMNS[index], field(record, index));
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| IngestError::MalformedRecord {
            line,
            message: format!("column '{name}' must be a finite number, found '{text}'"),
        })
}

/// Parses one row of the fixed-order event format:
/// `patient_id, visit_id, item_id, hour, variable_kind, val_num, val_min, val_max,
/// ref_min, ref_max, default, outcome_flag`.
pub fn parse_event(record: &csv::StringRecord, line: u64) -> Result<EventRecord, IngestError> {
    if record.len() != EVENT_COLUMN_COUNT {
        return Err(IngestError::MalformedRecord {
            line,
            message: format!(
                "expected {EVENT_COLUMN_COUNT} columns, found {}",
                record.len()
            ),
        });
    }

    let outcome = parse_f64(record, 11, line)?;
    Ok(EventRecord {
        patient_id: PatientId(parse_u64(record, 0, line)?),
        visit_id: VisitId(parse_u64(record, 1, line)?),
        item_id: ItemId(parse_u64(record, 2, line)?),
        hour: parse_i64(record, 3, line)?,
        kind_code: parse_f64(record, 4, line)?,
        value: parse_f64(record, 5, line)?,
        observed_min: parse_f64(record, 6, line)?,
        observed_max: parse_f64(record, 7, line)?,
        reference_min: parse_f64(record, 8, line)?,
        reference_max: parse_f64(record, 9, line)?,
        default_value: parse_f64(record, 10, line)?,
        outcome: outcome != 0.0,
    })
}

/// A streaming reader over the event CSV. The header row is skipped; rows are yielded
/// with their 1-based source line number.
pub struct EventReader {
    inner: csv::Reader<Box<dyn Read>>,
    record: csv::StringRecord,
}

impl EventReader {
    /// Opens an event file, transparently decompressing it when the path ends in `.gz`.
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        let file = File::open(path)?;
        let source: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
            Box::new(MultiGzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(file)
        };
        Ok(Self::from_boxed(source))
    }

    pub fn from_reader<R: Read + 'static>(reader: R) -> Self {
        Self::from_boxed(Box::new(reader))
    }

    fn from_boxed(source: Box<dyn Read>) -> Self {
        let inner = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(source);
        Self {
            inner,
            record: csv::StringRecord::new(),
        }
    }
}

impl Iterator for EventReader {
    type Item = Result<(u64, EventRecord), IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.read_record(&mut self.record) {
            Ok(false) => None,
            Ok(true) => {
                let line = self.record.position().map_or(0, |p| p.line());
                Some(parse_event(&self.record, line).map(|event| (line, event)))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

// ========================================================================================
//                               Diagnostics & batching
// ========================================================================================

/// Counters for every recoverable skip, reported at end of run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub rows: u64,
    pub applied: u64,
    pub skipped_sentinel: u64,
    pub skipped_window: u64,
    pub skipped_horizon: u64,
    pub skipped_unknown_item: u64,
    pub visits_created: u64,
    pub visits_recreated: u64,
}

/// The append-only set of item ids that had no catalog mapping.
#[derive(Debug, Default)]
pub struct UnknownItems {
    seen: AHashSet<ItemId>,
}

impl UnknownItems {
    #[inline]
    pub fn record(&mut self, item: ItemId) {
        self.seen.insert(item);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Every unknown id exactly once, in ascending order.
    pub fn report(&self) -> Vec<ItemId> {
        let mut items: Vec<ItemId> = self.seen.iter().copied().collect();
        items.sort_unstable();
        items
    }
}

/// The live visits of the current batch, kept in creation order.
#[derive(Debug, Default)]
pub struct VisitBatch {
    visits: Vec<VisitState>,
    index: AHashMap<VisitKey, usize>,
}

impl VisitBatch {
    pub fn len(&self) -> usize {
        self.visits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
    }

    pub fn get(&self, visit: VisitKey) -> Option<&VisitState> {
        self.index.get(&visit).map(|&i| &self.visits[i])
    }

    pub fn visits(&self) -> &[VisitState] {
        &self.visits
    }

    pub fn visits_mut(&mut self) -> impl Iterator<Item = &mut VisitState> {
        self.visits.iter_mut()
    }

    /// Empties the batch, handing the visits out in creation order.
    pub fn take(&mut self) -> Vec<VisitState> {
        self.index.clear();
        std::mem::take(&mut self.visits)
    }
}

/// What happened to one ingested row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    SkippedSentinel,
    SkippedWindow,
    SkippedHorizon,
    SkippedUnknownItem,
}

// ========================================================================================
//                                    The ingester
// ========================================================================================

pub struct EventIngester {
    catalog: Arc<FeatureCatalog>,
    normalizer: Normalizer,
    composites: Arc<CompositeTally>,
    seed: VisitSeed,
    sentinel: PatientId,
    window: Option<PatientWindow>,
    special: SpecialItems,
    unknown: UnknownItems,
    stats: IngestStats,
    /// Number of times each visit has already been flushed in this run. It holds one
    /// entry per distinct visit written so far and lives for the whole run, because a
    /// visit can reappear at any later point of an unsorted stream.
    flushed: AHashMap<VisitKey, u32>,
}

impl EventIngester {
    pub fn new(
        config: &EncoderConfig,
        catalog: Arc<FeatureCatalog>,
        normalizer: Normalizer,
        composites: Arc<CompositeTally>,
    ) -> Self {
        let seed = VisitSeed::new(
            normalizer.seed_column(&catalog),
            composites.seed_columns(),
            config.horizon_hours,
        );
        Self {
            catalog,
            normalizer,
            composites,
            seed,
            sentinel: PatientId(config.catalog_sentinel),
            window: config.patient_window,
            special: config.special.clone(),
            unknown: UnknownItems::default(),
            stats: IngestStats::default(),
            flushed: AHashMap::new(),
        }
    }

    pub fn seed(&self) -> &VisitSeed {
        &self.seed
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn unknown_items(&self) -> &UnknownItems {
        &self.unknown
    }

    /// Applies one event to the batch, creating the owning visit on first sight.
    pub fn ingest(
        &mut self,
        batch: &mut VisitBatch,
        event: &EventRecord,
        line: u64,
    ) -> Result<IngestOutcome, IngestError> {
        self.stats.rows += 1;

        if event.patient_id == self.sentinel {
            self.stats.skipped_sentinel += 1;
            return Ok(IngestOutcome::SkippedSentinel);
        }
        if self.window.is_some_and(|w| !w.contains(event.patient_id)) {
            self.stats.skipped_window += 1;
            return Ok(IngestOutcome::SkippedWindow);
        }
        let horizon = self.seed.horizon();
        if event.hour < 0 || event.hour as u64 >= horizon as u64 {
            self.stats.skipped_horizon += 1;
            log::trace!("Line {line}: hour {} lies outside the horizon.", event.hour);
            return Ok(IngestOutcome::SkippedHorizon);
        }
        let hour = event.hour as usize;

        let Some(feature) = self.catalog.feature_for(event.item_id) else {
            self.unknown.record(event.item_id);
            self.stats.skipped_unknown_item += 1;
            return Ok(IngestOutcome::SkippedUnknownItem);
        };

        let kind = VariableKind::from_code(event.kind_code)
            .map_err(|source| IngestError::UnknownKind { line, source })?;

        let admission = if self.special.admit_hour_item == Some(event.item_id) {
            let row = admission_hour_row(&self.normalizer, horizon, event.value).ok_or_else(|| {
                IngestError::MalformedRecord {
                    line,
                    message: format!(
                        "admission hour must be a whole hour in [0, {}], found {}",
                        HOURS_PER_DAY - 1,
                        event.value
                    ),
                }
            })?;
            Some(row)
        } else {
            None
        };

        let slot = self.resolve_visit(batch, event);
        let visit = &mut batch.visits[slot];

        if let Some(row) = admission {
            visit.replace_row(feature, row.view());
        } else if self.special.is_static(event.item_id) {
            let encoded = self.encode(event, kind, feature);
            visit.fill_row_once(feature, encoded);
        } else {
            let encoded = self.encode(event, kind, feature);
            if kind.is_point() {
                visit.write_point(feature, hour, encoded);
            } else {
                visit.write_carry_forward(feature, hour, encoded);
            }
        }

        if let Some((composite, sub_item)) = self.composites.locate(event.item_id) {
            visit.record_sub_item(composite, sub_item, hour, event.value);
        }

        self.stats.applied += 1;
        Ok(IngestOutcome::Applied)
    }

    /// Notes that a visit was serialized, so a later event for the same id starts a
    /// new generation instead of silently reusing the name.
    pub fn mark_flushed(&mut self, visit: &VisitState) {
        self.flushed.insert(visit.key(), visit.generation() + 1);
    }

    #[inline]
    fn encode(&self, event: &EventRecord, kind: VariableKind, feature: FeatureIndex) -> f64 {
        self.normalizer.normalize(
            event.value,
            kind,
            self.catalog.stats(feature),
            event.reference_min,
            event.reference_max,
        )
    }

    fn resolve_visit(&mut self, batch: &mut VisitBatch, event: &EventRecord) -> usize {
        let key = event.visit_key();
        if let Some(&slot) = batch.index.get(&key) {
            let visit = &batch.visits[slot];
            if visit.outcome() != event.outcome {
                log::debug!("Visit {key} carries conflicting outcome flags; keeping the first.");
            }
            return slot;
        }

        let generation = self.flushed.get(&key).copied().unwrap_or(0);
        if generation > 0 {
            self.stats.visits_recreated += 1;
            log::warn!(
                "Visit {key} reappeared after its batch was flushed; encoding it as a new visit (generation {generation})."
            );
        }
        self.stats.visits_created += 1;

        let slot = batch.visits.len();
        batch.visits.push(VisitState::new(
            event.patient_id,
            event.visit_id,
            event.outcome,
            generation,
            &self.seed,
        ));
        batch.index.insert(key, slot);
        slot
    }
}

/// Builds the full admission hour-of-day row: the hour-of-day cycle over the horizon,
/// rotated left by the admission hour and rescaled onto the output range.
///
/// Returns `None` unless `admit_hour` is a whole hour of the day.
pub fn admission_hour_row(normalizer: &Normalizer, horizon: usize, admit_hour: f64) -> Option<Array1<f64>> {
    if admit_hour.fract() != 0.0 || !(0.0..HOURS_PER_DAY as f64).contains(&admit_hour) {
        return None;
    }
    let shift = (admit_hour as usize).checked_rem(horizon).unwrap_or(0);
    let mut cycle: Vec<usize> = (0..horizon).map(|c| c % HOURS_PER_DAY).collect();
    cycle.rotate_left(shift);
    Some(
        cycle
            .into_iter()
            .map(|hour| normalizer.hour_of_day(hour as f64))
            .collect(),
    )
}
