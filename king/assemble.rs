// ========================================================================================
//
//                               THE RESULT ASSEMBLER
//
// ========================================================================================
//
// Turns the kernel's flat list of pair results into the sparse, id-keyed relatedness
// document and persists it. Each pair appears exactly once, keyed by the id of its
// lower-indexed sample.

use crate::pipeline::PipelineError;
use crate::shared::files::BlobStore;
use crate::types::{PairResult, SampleLocator};
use log::info;
use std::collections::BTreeMap;

/// Sample id → (related sample id → coefficient).
pub type RelatednessMap = BTreeMap<String, BTreeMap<String, f32>>;

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledResults {
    pub map: RelatednessMap,
    /// `related[s]` is true when sample `s` appears in any surviving pair.
    pub related: Vec<bool>,
    pub num_pairs: usize,
}

impl AssembledResults {
    pub fn num_related_samples(&self) -> usize {
        self.related.iter().filter(|&&flag| flag).count()
    }

    /// The ids of every sample that appears in at least one pair, in sample order.
    pub fn related_ids<'a>(&'a self, samples: &'a [SampleLocator]) -> impl Iterator<Item = &'a str> {
        samples
            .iter()
            .zip(&self.related)
            .filter(|(_, flag)| **flag)
            .map(|(locator, _)| locator.id.as_str())
    }
}

/// Builds the sparse map from the reservoir's surviving results.
pub fn assemble(
    results: &[PairResult],
    samples: &[SampleLocator],
) -> Result<AssembledResults, PipelineError> {
    let mut related = vec![false; samples.len()];
    let mut map = RelatednessMap::new();
    for result in results {
        let (i, j) = (result.sample_i.get(), result.sample_j.get());
        if i >= j || j >= samples.len() {
            return Err(PipelineError::Format(format!(
                "Pair ({i}, {j}) is not a valid upper-triangle pair of {} samples",
                samples.len()
            )));
        }
        related[i] = true;
        related[j] = true;
        map.entry(samples[i].id.clone())
            .or_default()
            .insert(samples[j].id.clone(), result.coefficient);
    }
    Ok(AssembledResults {
        map,
        related,
        num_pairs: results.len(),
    })
}

/// Serializes the map as a pretty-printed JSON document.
pub fn to_document(map: &RelatednessMap) -> Result<Vec<u8>, PipelineError> {
    let mut doc = serde_json::to_vec_pretty(map)
        .map_err(|e| PipelineError::Format(format!("Failed to serialize results: {e}")))?;
    doc.push(b'\n');
    Ok(doc)
}

/// Serializes and writes the map. A write failure is fatal and carries the store's
/// underlying status.
pub fn write_results(
    map: &RelatednessMap,
    store: &dyn BlobStore,
    output: &str,
) -> Result<(), PipelineError> {
    let doc = to_document(map)?;
    store
        .write(output, &doc)
        .map_err(|e| e.with_context(&format!("writing results to '{output}'")))?;
    info!("Wrote {} bytes of results to {output}", doc.len());
    Ok(())
}
