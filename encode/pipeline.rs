// ========================================================================================
//
//                               THE ENCODING PIPELINE
//
// ========================================================================================
//
// ### Purpose ###
//
// Drives one single-threaded pass over an event stream. The run has three phases:
//
// 1.  Bootstrap: leading sentinel rows are absorbed into the `CatalogBuilder`.
// 2.  Freeze: at the first ordinary row (or at end of stream) the catalog becomes
//     read-only, and the seed column, composite tally and severity engines are built
//     from it exactly once.
// 3.  Stream: every later row is routed through the ingester, with the flusher
//     draining the batch at visit boundaries whenever it has grown past its budget.

use crate::artifact::{ArtifactError, ArtifactSink};
use crate::bootstrap::BootstrapError;
use crate::catalog::{CatalogBuilder, CatalogError};
use crate::composite::CompositeTally;
use crate::config::{ConfigError, EncoderConfig};
use crate::flush::BatchFlusher;
use crate::ingest::{EventIngester, EventReader, IngestError, IngestStats, VisitBatch};
use crate::normalize::Normalizer;
use crate::severity::{PredictionTally, SeverityError, SeverityScoreEngine};
use crate::types::{EventRecord, ItemId, PatientId};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Rows between progress refreshes.
const PROGRESS_STRIDE: u64 = 8192;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Severity(#[from] SeverityError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}

/// Everything a finished run reports.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub rows_read: u64,
    pub catalog_rows: u64,
    /// Catalog rows that arrived after the catalog was frozen.
    pub late_catalog_rows: u64,
    pub ingest: IngestStats,
    pub batches_flushed: u64,
    pub visits_flushed: u64,
    /// Every unmapped item id, once each, ascending.
    pub unknown_items: Vec<ItemId>,
    pub tallies: Vec<(String, PredictionTally)>,
}

fn create_spinner() -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(None, draw_target);
    if let Ok(style) = ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {pos} rows {msg}") {
        pb.set_style(style);
    }
    pb
}

pub struct Pipeline {
    config: EncoderConfig,
}

impl Pipeline {
    /// Validates `config` up front; a run never starts on a bad configuration.
    pub fn new(config: EncoderConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Runs the pipeline over an event file, decompressing `.gz` input on the fly.
    pub fn run_path(&self, path: &Path, sink: &mut dyn ArtifactSink) -> Result<RunSummary, PipelineError> {
        log::info!("Reading events from '{}'.", path.display());
        self.run(EventReader::open(path)?, sink)
    }

    /// Runs the pipeline over a stream of parsed rows tagged with their line numbers.
    pub fn run<I>(&self, events: I, sink: &mut dyn ArtifactSink) -> Result<RunSummary, PipelineError>
    where
        I: IntoIterator<Item = Result<(u64, EventRecord), IngestError>>,
    {
        let config = &self.config;
        let sentinel = PatientId(config.catalog_sentinel);
        let progress = create_spinner();
        let mut events = events.into_iter();
        let mut summary = RunSummary::default();

        // --- Bootstrap ---
        let mut builder = CatalogBuilder::new(config.feature_rows, config.horizon_hours);
        let mut pending = None;
        for row in events.by_ref() {
            let (line, event) = row?;
            summary.rows_read += 1;
            if event.patient_id == sentinel {
                builder.push(&event, line)?;
            } else {
                pending = Some((line, event));
                break;
            }
        }

        // --- Freeze ---
        summary.catalog_rows = builder.rows_seen();
        let catalog = Arc::new(builder.finish());
        log::info!(
            "Catalog frozen: {} of {} feature rows defined, {} items mapped from {} rows.",
            catalog.defined_feature_count(),
            catalog.feature_rows(),
            catalog.item_count(),
            summary.catalog_rows
        );

        let normalizer = Normalizer::new(&config.normalization, config.output_range);
        let composites = Arc::new(CompositeTally::new(&config.composites, &catalog));
        let mut ingester = EventIngester::new(config, Arc::clone(&catalog), normalizer, Arc::clone(&composites));
        let engines = if config.scoring.enabled {
            config
                .scoring
                .systems
                .iter()
                .map(|system| SeverityScoreEngine::build(system, &catalog, ingester.seed(), config.output_range))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };
        let mut flusher = BatchFlusher::new(
            config.batch_rows,
            config.split,
            Arc::clone(&catalog),
            normalizer,
            composites,
            engines,
        );
        let mut batch = VisitBatch::default();

        // --- Stream ---
        loop {
            let (line, event) = match pending.take() {
                Some(first) => first,
                None => match events.next() {
                    Some(row) => {
                        summary.rows_read += 1;
                        row?
                    }
                    None => break,
                },
            };
            if summary.rows_read % PROGRESS_STRIDE == 0 {
                progress.set_position(summary.rows_read);
            }

            if event.patient_id == sentinel {
                summary.late_catalog_rows += 1;
                if summary.late_catalog_rows == 1 {
                    log::warn!(
                        "Line {line}: catalog row after the first event. The catalog is frozen; this and any later catalog rows are ignored."
                    );
                } else {
                    log::debug!("Line {line}: ignoring late catalog row.");
                }
                continue;
            }

            if flusher.should_flush(event.visit_key()) {
                progress.set_message(format!("flushing batch {}", flusher.batches_flushed() + 1));
                flusher.flush(&mut batch, &mut ingester, sink)?;
                progress.set_message("");
            }
            ingester.ingest(&mut batch, &event, line)?;
            flusher.observe(event.visit_key());
        }

        flusher.flush(&mut batch, &mut ingester, sink)?;
        progress.finish_and_clear();

        summary.ingest = ingester.stats().clone();
        summary.batches_flushed = flusher.batches_flushed();
        summary.visits_flushed = flusher.visits_flushed();
        summary.unknown_items = ingester.unknown_items().report();
        summary.tallies = flusher
            .engines()
            .iter()
            .map(|engine| (engine.name().to_string(), *engine.tally()))
            .collect();

        self.report(&summary);
        Ok(summary)
    }

    fn report(&self, summary: &RunSummary) {
        let stats = &summary.ingest;
        log::info!(
            "Read {} rows: {} applied, {} outside the patient window, {} outside the horizon, {} with unknown items.",
            summary.rows_read,
            stats.applied,
            stats.skipped_window,
            stats.skipped_horizon,
            stats.skipped_unknown_item
        );
        log::info!(
            "Flushed {} visits in {} batches.",
            summary.visits_flushed,
            summary.batches_flushed
        );
        if stats.visits_recreated > 0 {
            log::warn!(
                "{} visits reappeared after their batch was flushed and were encoded as new generations.",
                stats.visits_recreated
            );
        }
        if summary.late_catalog_rows > 0 {
            log::warn!("Ignored {} late catalog rows.", summary.late_catalog_rows);
        }
        if !summary.unknown_items.is_empty() {
            log::warn!(
                "{} item ids had no catalog mapping: {}",
                summary.unknown_items.len(),
                summary.unknown_items.iter().join(", ")
            );
        }
        for (name, tally) in &summary.tallies {
            log::info!("Severity system '{name}': {tally}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemorySink;

    #[test]
    fn invalid_configs_are_rejected_before_running() {
        let config = EncoderConfig {
            horizon_hours: 0,
            ..EncoderConfig::default()
        };
        assert!(matches!(
            Pipeline::new(config),
            Err(PipelineError::Config(ConfigError::EmptyHorizon))
        ));
    }

    #[test]
    fn empty_stream_produces_an_empty_summary() {
        let pipeline = Pipeline::new(EncoderConfig::default()).unwrap();
        let mut sink = MemorySink::default();
        let rows: Vec<Result<(u64, EventRecord), IngestError>> = Vec::new();
        let summary = pipeline.run(rows, &mut sink).unwrap();
        assert_eq!(summary.rows_read, 0);
        assert_eq!(summary.batches_flushed, 0);
        assert_eq!(summary.tallies.len(), 2);
        assert!(sink.timelines.is_empty());
        assert_eq!(sink.batches, 0);
    }

    #[test]
    fn stream_errors_abort_the_run() {
        let pipeline = Pipeline::new(EncoderConfig::default()).unwrap();
        let mut sink = MemorySink::default();
        let rows = vec![Err(IngestError::MalformedRecord {
            line: 2,
            message: "bad".to_string(),
        })];
        assert!(matches!(
            pipeline.run(rows, &mut sink),
            Err(PipelineError::Ingest(IngestError::MalformedRecord { line: 2, .. }))
        ));
    }
}
