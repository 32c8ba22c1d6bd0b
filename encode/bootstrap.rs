//! # Catalog Bootstrap
//!
//! Clinical variables are curated by hand in a definition sheet: one line per feature,
//! listing every raw item id that is clinically equivalent to it together with the
//! feature's statistics. This module turns that sheet into the sentinel-tagged catalog
//! rows that must lead every event stream.

use crate::types::{EVENT_COLUMNS, FeatureIndex, ItemId, PatientId, UnknownVariableKind, VariableKind};
use ahash::AHashMap;
use std::io::{Read, Write};
use thiserror::Error;

/// Columns of the definition sheet, in order.
const DEFINITION_COLUMNS: usize = 11;
const ITEM_SEPARATOR: char = ';';

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("I/O error during catalog bootstrap: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error during catalog bootstrap: {0}")]
    Csv(#[from] csv::Error),
    #[error("Malformed definition at line {line}: {message}")]
    Malformed { line: u64, message: String },
    #[error("Definition at line {line}: {source}")]
    UnknownKind {
        line: u64,
        #[source]
        source: UnknownVariableKind,
    },
}

/// One line of the definition sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub description: String,
    pub feature: FeatureIndex,
    pub items: Vec<ItemId>,
    pub kind: VariableKind,
    pub value_count: f64,
    pub observed_min: f64,
    pub observed_max: f64,
    pub reference_min: f64,
    pub reference_max: f64,
    pub default_value: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapSummary {
    pub definitions: usize,
    pub skipped_empty: usize,
    pub duplicate_features: usize,
    pub rows_written: usize,
}

fn number(record: &csv::StringRecord, index: usize, line: u64) -> Result<f64, BootstrapError> {
    let text = record.get(index).unwrap_or("");
    text.parse::<f64>().map_err(|_| BootstrapError::Malformed {
        line,
        message: format!("column {index} must be numeric, found '{text}'"),
    })
}

fn parse_definition(record: &csv::StringRecord, line: u64) -> Result<VariableDefinition, BootstrapError> {
    if record.len() != DEFINITION_COLUMNS {
        return Err(BootstrapError::Malformed {
            line,
            message: format!("expected {DEFINITION_COLUMNS} columns, found {}", record.len()),
        });
    }

    let feature = record[2].parse::<usize>().map_err(|_| BootstrapError::Malformed {
        line,
        message: format!("feature index '{}' is not a non-negative integer", &record[2]),
    })?;

    let items = record[3]
        .split(ITEM_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map(ItemId).map_err(|_| BootstrapError::Malformed {
                line,
                message: format!("item id '{s}' is not a non-negative integer"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let kind = VariableKind::from_code(number(record, 4, line)?)
        .map_err(|source| BootstrapError::UnknownKind { line, source })?;

    Ok(VariableDefinition {
        name: record[0].to_string(),
        description: record[1].to_string(),
        feature: FeatureIndex(feature),
        items,
        kind,
        value_count: number(record, 5, line)?,
        observed_min: number(record, 6, line)?,
        observed_max: number(record, 7, line)?,
        reference_min: number(record, 8, line)?,
        reference_max: number(record, 9, line)?,
        default_value: number(record, 10, line)?,
    })
}

/// Reads every definition from a sheet with a header row.
pub fn read_definitions<R: Read>(reader: R) -> Result<Vec<VariableDefinition>, BootstrapError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut definitions = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |p| p.line());
        definitions.push(parse_definition(&record, line)?);
    }
    Ok(definitions)
}

/// Writes the catalog rows for `definitions`, headed by the event-format header.
///
/// A definition without items is skipped. When two definitions name the same feature,
/// the first one's statistics win and the later one's items are mapped onto them.
pub fn write_catalog<W: Write>(
    definitions: &[VariableDefinition],
    sentinel: PatientId,
    writer: W,
) -> Result<BootstrapSummary, BootstrapError> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(EVENT_COLUMNS)?;

    let mut summary = BootstrapSummary {
        definitions: definitions.len(),
        ..BootstrapSummary::default()
    };
    let mut first_by_feature: AHashMap<FeatureIndex, &VariableDefinition> = AHashMap::new();
    let mut ryu_buffer = ryu::Buffer::new();

    for definition in definitions {
        if definition.items.is_empty() {
            log::warn!(
                "Skipping variable '{}' (feature {}): it lists no item ids.",
                definition.name,
                definition.feature
            );
            summary.skipped_empty += 1;
            continue;
        }

        let stats = match first_by_feature.get(&definition.feature).copied() {
            Some(first) => {
                log::warn!(
                    "Variable '{}' repeats feature {}; keeping the statistics of '{}'.",
                    definition.name,
                    definition.feature,
                    first.name
                );
                summary.duplicate_features += 1;
                first
            }
            None => {
                first_by_feature.insert(definition.feature, definition);
                definition
            }
        };

        let numbers = [
            stats.value_count,
            stats.observed_min,
            stats.observed_max,
            stats.reference_min,
            stats.reference_max,
            stats.default_value,
        ];
        for item in &definition.items {
            let mut row = vec![
                sentinel.0.to_string(),
                definition.feature.to_string(),
                item.to_string(),
                "0".to_string(),
                stats.kind.code().to_string(),
            ];
            row.extend(numbers.iter().map(|&v| ryu_buffer.format(v).to_string()));
            row.push("0".to_string());
            out.write_record(&row)?;
            summary.rows_written += 1;
        }
    }

    out.flush()?;
    Ok(summary)
}

/// Reads a definition sheet and writes its catalog rows in one pass.
pub fn bootstrap<R: Read, W: Write>(
    definitions: R,
    sentinel: PatientId,
    writer: W,
) -> Result<BootstrapSummary, BootstrapError> {
    let definitions = read_definitions(definitions)?;
    let summary = write_catalog(&definitions, sentinel, writer)?;
    log::info!(
        "Bootstrapped {} catalog rows from {} definitions ({} without items, {} duplicate features).",
        summary.rows_written,
        summary.definitions,
        summary.skipped_empty,
        summary.duplicate_features
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogBuilder;
    use crate::ingest::EventReader;

    const SHEET: &str = "\
name,description,feature_index,item_ids,var_type,val_num,val_min,val_max,ref_min,ref_max,default
heart_rate,Heart rate,8,211;220045,1,1000,0,300,60,100,80
weight,Body weight,3,,1,10,0,200,0,0,70
hr_alt,Heart rate (alt),8,8549,2,5,0,999,0,0,0
sex,Sex flag,1,42,0,100,0,1,0,0,0
";

    #[test]
    fn definitions_parse_item_lists() {
        let defs = read_definitions(SHEET.as_bytes()).unwrap();
        assert_eq!(defs.len(), 4);
        assert_eq!(defs[0].items, vec![ItemId(211), ItemId(220045)]);
        assert_eq!(defs[0].kind, VariableKind::Continuous);
        assert!(defs[1].items.is_empty());
        assert_eq!(defs[3].kind, VariableKind::Binary);
    }

    #[test]
    fn catalog_rows_feed_straight_into_the_builder() {
        let mut output = Vec::new();
        let summary = bootstrap(SHEET.as_bytes(), PatientId(0), &mut output).unwrap();
        assert_eq!(
            summary,
            BootstrapSummary {
                definitions: 4,
                skipped_empty: 1,
                duplicate_features: 1,
                rows_written: 4,
            }
        );

        let mut builder = CatalogBuilder::new(10, 48);
        for row in EventReader::from_reader(std::io::Cursor::new(output)) {
            let (line, event) = row.unwrap();
            assert_eq!(event.patient_id, PatientId(0));
            builder.push(&event, line).unwrap();
        }
        let catalog = builder.finish();

        assert_eq!(catalog.feature_for(ItemId(8549)), Some(FeatureIndex(8)));
        assert_eq!(catalog.feature_for(ItemId(42)), Some(FeatureIndex(1)));
        let heart = catalog.stats(FeatureIndex(8));
        assert_eq!(heart.kind, VariableKind::Continuous);
        assert_eq!(heart.observed_max, 300.0);
        assert_eq!(heart.default_value, 80.0);
        assert!(!catalog.is_defined(FeatureIndex(3)));
    }

    #[test]
    fn bad_kind_codes_are_fatal() {
        let sheet = "h1,h2,h3,h4,h5,h6,h7,h8,h9,h10,h11\nx,y,2,5,9,1,0,1,0,0,0\n";
        assert!(matches!(
            read_definitions(sheet.as_bytes()),
            Err(BootstrapError::UnknownKind { line: 2, .. })
        ));
    }
}
