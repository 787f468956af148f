// ========================================================================================
//
//                       GENOTYPE TABLE → CONTAINER CONVERTER
//
// ========================================================================================
//
// Converts a plain-text genotype table into one container per sample plus the JSON
// sample map the compute path reads. Input lines are `sample_id<TAB>calls`, where
// `calls` is one symbol per marker: `0` hom-ref, `1` het, `2` hom-alt, `.` missing.
// Blank lines and `#` comments are skipped.

use crate::container::encode_sample;
use crate::pipeline::PipelineError;
use crate::shared::files::{BlobStore, join_object_path};
use crate::types::{GenotypeCall, pack_calls};
use ahash::AHashSet;
use log::{debug, info};
use rayon::prelude::*;
use std::collections::BTreeMap;

pub const CONTAINER_EXTENSION: &str = "king";
pub const SAMPLE_MAP_NAME: &str = "sample_map.json";

/// One parsed row of the genotype table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenotypeRow {
    pub sample_id: String,
    pub calls: Vec<GenotypeCall>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackSummary {
    pub num_samples: usize,
    pub num_markers: usize,
    pub sample_map_path: String,
}

/// Parses a genotype table, checking ids are unique and every row has the same number
/// of markers.
pub fn parse_genotype_table(text: &str) -> Result<Vec<GenotypeRow>, PipelineError> {
    let mut rows = Vec::new();
    let mut seen = AHashSet::new();
    let mut num_markers: Option<usize> = None;

    for (line_idx, line) in text.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let (sample_id, symbols) = line.split_once('\t').ok_or_else(|| {
            PipelineError::Format(format!("Line {line_no}: expected 'sample_id<TAB>calls'"))
        })?;
        let sample_id = sample_id.trim();
        if sample_id.is_empty() || sample_id.contains(['/', '\\']) {
            return Err(PipelineError::Format(format!(
                "Line {line_no}: invalid sample id '{sample_id}'"
            )));
        }
        if !seen.insert(sample_id.to_string()) {
            return Err(PipelineError::Format(format!(
                "Line {line_no}: duplicate sample id '{sample_id}'"
            )));
        }
        let calls = symbols
            .trim()
            .bytes()
            .enumerate()
            .map(|(marker, symbol)| {
                GenotypeCall::from_symbol(symbol).ok_or_else(|| {
                    PipelineError::Format(format!(
                        "Line {line_no}, marker {marker}: unknown call '{}'",
                        symbol as char
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if calls.is_empty() {
            return Err(PipelineError::Format(format!(
                "Line {line_no}: sample '{sample_id}' has no calls"
            )));
        }
        match num_markers {
            None => num_markers = Some(calls.len()),
            Some(expected) if expected != calls.len() => {
                return Err(PipelineError::Format(format!(
                    "Line {line_no}: sample '{sample_id}' has {} markers but earlier samples have {expected}",
                    calls.len()
                )));
            }
            Some(_) => {}
        }
        rows.push(GenotypeRow {
            sample_id: sample_id.to_string(),
            calls,
        });
    }

    if rows.is_empty() {
        return Err(PipelineError::Format("The genotype table has no samples".to_string()));
    }
    Ok(rows)
}

/// Writes one container per row under `output_dir`, then the sample map.
pub fn pack_samples(
    rows: &[GenotypeRow],
    store: &dyn BlobStore,
    output_dir: &str,
) -> Result<PackSummary, PipelineError> {
    let entries = rows
        .par_iter()
        .map(|row| -> Result<(String, String), PipelineError> {
            let (het, hom_alt) = pack_calls(&row.calls);
            let container = encode_sample(&het, &hom_alt)?;
            let path = join_object_path(
                output_dir,
                &format!("{}.{CONTAINER_EXTENSION}", row.sample_id),
            );
            store.write(&path, &container)?;
            debug!("Packed sample '{}' into {path}", row.sample_id);
            Ok((row.sample_id.clone(), path))
        })
        .collect::<Result<BTreeMap<String, String>, _>>()?;

    let sample_map_path = join_object_path(output_dir, SAMPLE_MAP_NAME);
    let doc = serde_json::to_vec_pretty(&entries)
        .map_err(|e| PipelineError::Format(format!("Failed to serialize sample map: {e}")))?;
    store.write(&sample_map_path, &doc)?;

    let num_markers = rows.first().map_or(0, |row| row.calls.len());
    info!(
        "Packed {} samples x {num_markers} markers; sample map at {sample_map_path}",
        rows.len()
    );
    Ok(PackSummary {
        num_samples: rows.len(),
        num_markers,
        sample_map_path,
    })
}
