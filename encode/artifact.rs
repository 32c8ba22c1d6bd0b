// ========================================================================================
//
//                               ARTIFACT SINKS
//
// ========================================================================================
//
// Everything the pipeline produces leaves through the `ArtifactSink` trait: one encoded
// matrix plus a label line per flushed visit, and one prediction line per visit per
// scoring system. Output is append-only; nothing written by an earlier batch is ever
// rewritten by a later one.

use crate::types::{PatientId, Split, VisitId};
use crate::visit::VisitState;
use ahash::AHashMap;
use ndarray::Array2;
use std::collections::hash_map::Entry;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LABELS_FILE: &str = "labels.csv";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("I/O error writing or reading artifacts: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error reading artifacts: {0}")]
    Csv(#[from] csv::Error),
    #[error("Malformed artifact '{path}': {message}")]
    Malformed { path: PathBuf, message: String },
}

/// The destination for flushed visits and their severity predictions.
pub trait ArtifactSink {
    fn write_timeline(&mut self, split: Split, visit: &VisitState) -> Result<(), ArtifactError>;

    fn append_score(
        &mut self,
        system: &str,
        split: Split,
        prediction: bool,
        outcome: bool,
    ) -> Result<(), ArtifactError>;

    /// Called once after every flushed batch, after all of its writes.
    fn finish_batch(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }
}

/// `<patient>_<visit>_<outcome>`, with a `_g<generation>` tag before the outcome when the
/// visit id was already flushed earlier in the run.
pub fn artifact_name(
    patient: PatientId,
    visit: VisitId,
    generation: u32,
    outcome: bool,
) -> String {
    let outcome = u8::from(outcome);
    if generation == 0 {
        format!("{}_{}_{outcome}", patient.0, visit.0)
    } else {
        format!("{}_{}_g{generation}_{outcome}", patient.0, visit.0)
    }
}

fn visit_name(visit: &VisitState) -> String {
    artifact_name(
        visit.patient_id(),
        visit.visit_id(),
        visit.generation(),
        visit.outcome(),
    )
}

// ========================================================================================
//                                  The directory sink
// ========================================================================================

/// Writes CSV artifacts under `<root>/<split>/`.
pub struct DirectorySink {
    root: PathBuf,
    appenders: AHashMap<PathBuf, BufWriter<File>>,
    line: String,
}

impl DirectorySink {
    /// Creates the three split directories under `root` if they do not exist yet.
    pub fn new(root: &Path) -> Result<Self, ArtifactError> {
        for split in Split::ALL {
            fs::create_dir_all(root.join(split.as_str()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            appenders: AHashMap::new(),
            line: String::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn split_dir(&self, split: Split) -> PathBuf {
        self.root.join(split.as_str())
    }

    fn append_line(&mut self, path: PathBuf, line: &str) -> Result<(), ArtifactError> {
        let writer = match self.appenders.entry(path) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(entry.key())?;
                entry.insert(BufWriter::new(file))
            }
        };
        writeln!(writer, "{line}")?;
        Ok(())
    }
}

impl ArtifactSink for DirectorySink {
    fn write_timeline(&mut self, split: Split, visit: &VisitState) -> Result<(), ArtifactError> {
        let name = visit_name(visit);
        let dir = self.split_dir(split);
        let mut writer = BufWriter::new(File::create(dir.join(format!("{name}.csv")))?);
        let mut ryu_buffer = ryu::Buffer::new();

        for row in visit.timeline().rows() {
            self.line.clear();
            for (hour, &value) in row.iter().enumerate() {
                if hour > 0 {
                    self.line.push(',');
                }
                self.line.push_str(ryu_buffer.format(value));
            }
            writeln!(writer, "{}", self.line)?;
        }
        writer.flush()?;

        let label = format!("{name},{}", u8::from(visit.outcome()));
        self.append_line(dir.join(LABELS_FILE), &label)
    }

    fn append_score(
        &mut self,
        system: &str,
        split: Split,
        prediction: bool,
        outcome: bool,
    ) -> Result<(), ArtifactError> {
        let path = self.split_dir(split).join(format!("{system}_preds.csv"));
        let line = format!("{},{}", u8::from(prediction), u8::from(outcome));
        self.append_line(path, &line)
    }

    fn finish_batch(&mut self) -> Result<(), ArtifactError> {
        for writer in self.appenders.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

// ========================================================================================
//                                   The memory sink
// ========================================================================================

#[derive(Debug, Clone)]
pub struct StoredTimeline {
    pub name: String,
    pub split: Split,
    pub outcome: bool,
    pub timeline: Array2<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredScore {
    pub system: String,
    pub split: Split,
    pub prediction: bool,
    pub outcome: bool,
}

/// Keeps every artifact in memory, in write order.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub timelines: Vec<StoredTimeline>,
    pub scores: Vec<StoredScore>,
    pub batches: usize,
}

impl MemorySink {
    pub fn timeline(&self, name: &str) -> Option<&StoredTimeline> {
        self.timelines.iter().find(|t| t.name == name)
    }

    pub fn scores_for(&self, system: &str) -> impl Iterator<Item = &StoredScore> + '_ {
        let system = system.to_string();
        self.scores.iter().filter(move |s| s.system == system)
    }
}

impl ArtifactSink for MemorySink {
    fn write_timeline(&mut self, split: Split, visit: &VisitState) -> Result<(), ArtifactError> {
        self.timelines.push(StoredTimeline {
            name: visit_name(visit),
            split,
            outcome: visit.outcome(),
            timeline: visit.timeline().to_owned(),
        });
        Ok(())
    }

    fn append_score(
        &mut self,
        system: &str,
        split: Split,
        prediction: bool,
        outcome: bool,
    ) -> Result<(), ArtifactError> {
        self.scores.push(StoredScore {
            system: system.to_string(),
            split,
            prediction,
            outcome,
        });
        Ok(())
    }

    fn finish_batch(&mut self) -> Result<(), ArtifactError> {
        self.batches += 1;
        Ok(())
    }
}

// ========================================================================================
//                                 Reading artifacts back
// ========================================================================================

/// One labelled visit read back from a split directory.
#[derive(Debug, Clone)]
pub struct TimelineSample {
    pub name: String,
    pub timeline: Array2<f64>,
    pub outcome: bool,
}

/// Iterates a split directory in label-file order, loading each matrix on demand.
pub struct TimelineDataset {
    dir: PathBuf,
    labels: Vec<(String, bool)>,
    cursor: usize,
}

impl TimelineDataset {
    pub fn open(root: &Path, split: Split) -> Result<Self, ArtifactError> {
        let dir = root.join(split.as_str());
        let labels_path = dir.join(LABELS_FILE);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&labels_path)?;

        let mut labels = Vec::new();
        for record in reader.records() {
            let record = record?;
            let malformed = |message: String| ArtifactError::Malformed {
                path: labels_path.clone(),
                message,
            };
            if record.len() != 2 {
                return Err(malformed(format!("expected 2 columns, found {}", record.len())));
            }
            let outcome = match &record[1] {
                "0" => false,
                "1" => true,
                other => return Err(malformed(format!("outcome '{other}' is not 0 or 1"))),
            };
            labels.push((record[0].to_string(), outcome));
        }

        Ok(Self {
            dir,
            labels,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn load(&self, name: &str) -> Result<Array2<f64>, ArtifactError> {
        let path = self.dir.join(format!("{name}.csv"));
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)?;

        let mut values = Vec::new();
        let mut rows = 0;
        let mut cols = None;
        for record in reader.records() {
            let record = record?;
            match cols {
                None => cols = Some(record.len()),
                Some(n) if n != record.len() => {
                    return Err(ArtifactError::Malformed {
                        path,
                        message: format!("row {rows} has {} values, expected {n}", record.len()),
                    });
                }
                Some(_) => {}
            }
            for field in record.iter() {
                let value = field.parse::<f64>().map_err(|_| ArtifactError::Malformed {
                    path: path.clone(),
                    message: format!("'{field}' is not a number"),
                })?;
                values.push(value);
            }
            rows += 1;
        }

        Array2::from_shape_vec((rows, cols.unwrap_or(0)), values).map_err(|e| {
            ArtifactError::Malformed {
                path,
                message: e.to_string(),
            }
        })
    }
}

impl Iterator for TimelineDataset {
    type Item = Result<TimelineSample, ArtifactError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (name, outcome) = self.labels.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(self.load(&name).map(|timeline| TimelineSample {
            name,
            timeline,
            outcome,
        }))
    }
}
