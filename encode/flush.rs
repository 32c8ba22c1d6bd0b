//! # Batch Flushing
//!
//! Bounds memory by periodically draining the live visit batch. The flush decision is
//! made before each row is applied: once enough rows have arrived since the last flush,
//! the batch is drained at the first visit boundary, so a visit's events always land in
//! one batch as long as the stream delivers them contiguously.

use crate::artifact::{ArtifactError, ArtifactSink};
use crate::catalog::FeatureCatalog;
use crate::composite::CompositeTally;
use crate::config::SplitFractions;
use crate::ingest::{EventIngester, VisitBatch};
use crate::normalize::Normalizer;
use crate::severity::SeverityScoreEngine;
use crate::types::VisitKey;
use std::sync::Arc;

/// Counts of everything a flush emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub visits: usize,
    pub rows: usize,
}

pub struct BatchFlusher {
    batch_rows: usize,
    split: SplitFractions,
    rows_since_flush: usize,
    previous_visit: Option<VisitKey>,
    batches_flushed: u64,
    visits_flushed: u64,
    catalog: Arc<FeatureCatalog>,
    normalizer: Normalizer,
    composites: Arc<CompositeTally>,
    engines: Vec<SeverityScoreEngine>,
}

impl BatchFlusher {
    pub fn new(
        batch_rows: usize,
        split: SplitFractions,
        catalog: Arc<FeatureCatalog>,
        normalizer: Normalizer,
        composites: Arc<CompositeTally>,
        engines: Vec<SeverityScoreEngine>,
    ) -> Self {
        Self {
            batch_rows,
            split,
            rows_since_flush: 0,
            previous_visit: None,
            batches_flushed: 0,
            visits_flushed: 0,
            catalog,
            normalizer,
            composites,
            engines,
        }
    }

    /// Whether the batch must be flushed before a row for `visit` is applied.
    #[inline]
    pub fn should_flush(&self, visit: VisitKey) -> bool {
        self.rows_since_flush >= self.batch_rows && self.previous_visit != Some(visit)
    }

    /// Records that a row for `visit` was consumed, whether or not it was applied.
    #[inline]
    pub fn observe(&mut self, visit: VisitKey) {
        self.rows_since_flush += 1;
        self.previous_visit = Some(visit);
    }

    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed
    }

    pub fn visits_flushed(&self) -> u64 {
        self.visits_flushed
    }

    pub fn engines(&self) -> &[SeverityScoreEngine] {
        &self.engines
    }

    /// Drains the batch: tallies composites, writes every timeline with its split, scores
    /// every visit with every engine, then tells the sink the batch is complete.
    pub fn flush(
        &mut self,
        batch: &mut VisitBatch,
        ingester: &mut EventIngester,
        sink: &mut dyn ArtifactSink,
    ) -> Result<FlushReport, ArtifactError> {
        let rows = self.rows_since_flush;
        self.rows_since_flush = 0;
        if batch.is_empty() {
            return Ok(FlushReport { visits: 0, rows });
        }

        self.composites
            .tally_batch(batch.visits_mut(), &self.normalizer, &self.catalog);

        let visits = batch.take();
        let count = visits.len();
        let splits: Vec<_> = (0..count).map(|i| self.split.assign(i, count)).collect();

        for (visit, &split) in visits.iter().zip(&splits) {
            sink.write_timeline(split, visit)?;
        }

        for engine in &mut self.engines {
            for (visit, &split) in visits.iter().zip(&splits) {
                let score = engine.score_visit(visit);
                engine.record(&score, visit.outcome());
                sink.append_score(engine.name(), split, score.prediction, visit.outcome())?;
            }
        }

        sink.finish_batch()?;

        for visit in &visits {
            ingester.mark_flushed(visit);
        }
        self.batches_flushed += 1;
        self.visits_flushed += count as u64;
        log::info!(
            "Flushed batch {} with {count} visits ({rows} rows).",
            self.batches_flushed
        );

        Ok(FlushReport { visits: count, rows })
    }
}
