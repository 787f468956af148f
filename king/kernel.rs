// ========================================================================================
//
//                 The kernel: A massively parallel pairwise comparison
//
// ========================================================================================
//
// This module contains the innermost loop of the engine: a per-pair popcount reduction
// over the two samples' bit-vectors, the KING-robust estimator on top of it, and the
// flat parallel grid that evaluates every pair. The hot path is allocation-free. The
// only state shared between pair tasks is the reservoir's atomic cursor.

use crate::matrix::GenotypeMatrix;
use crate::pipeline::PipelineError;
use crate::types::{PairResult, SampleBits, SampleIndex};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// The number of completed kernel rows to accumulate locally before touching the shared
/// progress counter.
const PROGRESS_UPDATE_BATCH_SIZE: u64 = 64;

/// The minimum number of flat grid indices a rayon task handles, so that the many
/// no-op lower-triangle indices are skipped in bulk rather than one task each.
const MIN_GRID_CHUNK: usize = 4096;

// ========================================================================================
//                            Public API & type definitions
// ========================================================================================

/// The four population counts the estimator needs for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairCounts {
    pub het_i: u64,
    pub het_j: u64,
    pub both_het: u64,
    pub opposing_hom: u64,
}

impl PairCounts {
    /// The KING-robust kinship coefficient:
    ///
    /// `0.5 + (2·both_het − 4·opposing_hom − het_i − het_j) / (4·min(het_i, het_j))`
    ///
    /// Returns `None` when either sample has no heterozygous calls, where the estimator
    /// is undefined. Such pairs never pass a threshold.
    #[inline]
    pub fn coefficient(&self) -> Option<f32> {
        let min_het = self.het_i.min(self.het_j);
        if min_het == 0 {
            return None;
        }
        let numerator = 2 * self.both_het as i64
            - 4 * self.opposing_hom as i64
            - self.het_i as i64
            - self.het_j as i64;
        Some(0.5 + numerator as f32 / (4 * min_het) as f32)
    }
}

/// Accumulates the estimator's counts word by word over two samples.
///
/// A marker where both `het` and `hom_alt` are set is missing; `observed` masks such
/// markers out. The per-sample het counts use that sample's own mask; the joint counts
/// use the intersection of both masks.
#[inline]
pub fn pair_counts(a: SampleBits<'_>, b: SampleBits<'_>) -> PairCounts {
    let mut counts = PairCounts::default();
    let words = a
        .het
        .iter()
        .zip(a.hom_alt)
        .zip(b.het.iter().zip(b.hom_alt));
    for ((&het_i, &hom_alt_i), (&het_j, &hom_alt_j)) in words {
        let hom_ref_i = !het_i & !hom_alt_i;
        let hom_ref_j = !het_j & !hom_alt_j;
        let observed_i = !(het_i & hom_alt_i);
        let observed_j = !(het_j & hom_alt_j);
        let observed = observed_i & observed_j;

        counts.het_i += (het_i & observed_i).count_ones() as u64;
        counts.het_j += (het_j & observed_j).count_ones() as u64;
        counts.both_het += (het_i & het_j & observed).count_ones() as u64;
        counts.opposing_hom +=
            (((hom_ref_i & hom_alt_j) | (hom_ref_j & hom_alt_i)) & observed).count_ones() as u64;
    }
    counts
}

/// The KING coefficient for samples `i` and `j` of a matrix, or `None` if undefined.
#[inline]
pub fn king_coefficient(matrix: &GenotypeMatrix, i: usize, j: usize) -> Option<f32> {
    pair_counts(matrix.sample(i), matrix.sample(j)).coefficient()
}

// ========================================================================================
//                                  The result reservoir
// ========================================================================================

/// A fixed-capacity result buffer with one atomic cursor shared by all pair tasks.
///
/// Each accepted result reserves a unique slot with a single `fetch_add`. Once the
/// cursor passes the capacity, results are dropped but still counted, so overflow is
/// distinguishable from "no matches" and is never mistaken for a complete result set.
#[derive(Debug)]
pub struct Reservoir {
    slots: Box<[OnceLock<PairResult>]>,
    cursor: AtomicUsize,
}

impl Reservoir {
    pub fn with_capacity(capacity: usize) -> Result<Self, PipelineError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|e| {
            PipelineError::Allocation(format!(
                "Cannot allocate a result reservoir of {capacity} entries: {e}"
            ))
        })?;
        slots.resize_with(capacity, OnceLock::new);
        Ok(Self {
            slots: slots.into_boxed_slice(),
            cursor: AtomicUsize::new(0),
        })
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The number of results offered so far, including dropped ones.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Reserves a slot and stores `result` in it. Returns `false` if the reservoir was
    /// already full; the cursor counts the result either way.
    #[inline]
    pub fn push(&self, result: PairResult) -> bool {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed);
        match self.slots.get(slot) {
            Some(cell) => cell.set(result).is_ok(),
            None => false,
        }
    }

    /// Consumes the reservoir after the kernel has completed.
    ///
    /// Fails with `PipelineError::Capacity` if more results were offered than fit.
    pub fn into_results(self) -> Result<Vec<PairResult>, PipelineError> {
        let found = self.cursor.into_inner();
        let capacity = self.slots.len();
        if found > capacity {
            return Err(PipelineError::Capacity { found, capacity });
        }
        Ok(self
            .slots
            .into_vec()
            .into_iter()
            .take(found)
            .filter_map(OnceLock::into_inner)
            .collect())
    }
}

// ========================================================================================
//                              The kernel implementation
// ========================================================================================

/// Evaluates every pair `(i, j)` with `i` in `rows` and `i < j < num_samples`, and
/// offers each pair whose coefficient exceeds `threshold` to the reservoir.
///
/// The parallel domain is the flat index space `[rows.start·n, rows.end·n)`; index
/// `idx` maps to `i = idx / n`, `j = idx % n`, and indices with `i ≥ j` do no work.
/// `rows_done` is advanced by the number of completed rows, in batches.
///
/// This call returns only after every pair task has finished, so the matrix borrow and
/// the reservoir writes are complete when it returns.
pub fn compute_relatedness(
    matrix: &GenotypeMatrix,
    rows: Range<usize>,
    threshold: f32,
    reservoir: &Reservoir,
    rows_done: &AtomicU64,
) -> Result<(), PipelineError> {
    let n = matrix.num_samples();
    if rows.start > rows.end || rows.end > n {
        return Err(PipelineError::Config(format!(
            "Sample range [{}, {}) is outside the {n} loaded samples",
            rows.start, rows.end
        )));
    }
    let overflow = || {
        PipelineError::Allocation(format!(
            "The pair grid for {n} samples overflows the index space"
        ))
    };
    let start = rows.start.checked_mul(n).ok_or_else(overflow)?;
    let end = rows.end.checked_mul(n).ok_or_else(overflow)?;

    (start..end)
        .into_par_iter()
        .with_min_len(MIN_GRID_CHUNK)
        .fold(
            || 0u64,
            |mut local_rows, idx| {
                let i = idx / n;
                let j = idx % n;
                if j == n - 1 {
                    local_rows += 1;
                    if local_rows == PROGRESS_UPDATE_BATCH_SIZE {
                        rows_done.fetch_add(local_rows, Ordering::Relaxed);
                        local_rows = 0;
                    }
                }
                if i >= j {
                    return local_rows;
                }
                if let Some(coefficient) = king_coefficient(matrix, i, j) {
                    if coefficient > threshold {
                        reservoir.push(PairResult {
                            sample_i: SampleIndex(i as u32),
                            sample_j: SampleIndex(j as u32),
                            coefficient,
                        });
                    }
                }
                local_rows
            },
        )
        .for_each(|local_rows| {
            if local_rows > 0 {
                rows_done.fetch_add(local_rows, Ordering::Relaxed);
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits<'a>(het: &'a [u64], hom_alt: &'a [u64]) -> SampleBits<'a> {
        SampleBits { het, hom_alt }
    }

    #[test]
    fn identical_heterozygous_samples_score_one_half() {
        // Four shared het markers, nothing else: 0.5 + (8 - 0 - 4 - 4) / 16.
        let counts = pair_counts(bits(&[0b1111], &[0]), bits(&[0b1111], &[0]));
        assert_eq!(
            counts,
            PairCounts {
                het_i: 4,
                het_j: 4,
                both_het: 4,
                opposing_hom: 0
            }
        );
        assert_eq!(counts.coefficient(), Some(0.5));
    }

    #[test]
    fn opposing_homozygotes_pull_the_coefficient_down() {
        // i: het at bits 0-1, hom-alt at bit 2. j: het at bits 0-1, hom-ref at bit 2.
        let counts = pair_counts(bits(&[0b011], &[0b100]), bits(&[0b011], &[0]));
        assert_eq!(counts.opposing_hom, 1);
        assert_eq!(counts.both_het, 2);
        // 0.5 + (4 - 4 - 2 - 2) / 8 = 0.0
        assert_eq!(counts.coefficient(), Some(0.0));
    }

    #[test]
    fn missing_markers_are_masked_out() {
        // Bit 0 is missing in i (het and hom_alt both set) and het in j.
        let counts = pair_counts(bits(&[0b11], &[0b01]), bits(&[0b11], &[0]));
        assert_eq!(counts.het_i, 1);
        assert_eq!(counts.het_j, 2);
        assert_eq!(counts.both_het, 1);
        assert_eq!(counts.opposing_hom, 0);
    }

    #[test]
    fn zero_heterozygotes_make_the_coefficient_undefined() {
        let counts = pair_counts(bits(&[0], &[u64::MAX]), bits(&[0b1], &[0]));
        assert_eq!(counts.het_i, 0);
        assert_eq!(counts.coefficient(), None);
    }

    #[test]
    fn reservoir_counts_past_capacity_and_reports_overflow() {
        let reservoir = Reservoir::with_capacity(2).unwrap();
        let result = PairResult {
            sample_i: SampleIndex(0),
            sample_j: SampleIndex(1),
            coefficient: 0.25,
        };
        assert!(reservoir.push(result));
        assert!(reservoir.push(result));
        assert!(!reservoir.push(result));
        assert_eq!(reservoir.cursor(), 3);
        assert!(matches!(
            reservoir.into_results(),
            Err(PipelineError::Capacity {
                found: 3,
                capacity: 2
            })
        ));
    }

    #[test]
    fn kernel_emits_only_the_strict_upper_triangle() {
        let sample = (vec![0xffu64], vec![0u64]);
        let matrix = GenotypeMatrix::from_samples(&vec![sample; 5]).unwrap();
        let reservoir = Reservoir::with_capacity(100).unwrap();
        let rows_done = AtomicU64::new(0);

        compute_relatedness(&matrix, 0..5, 0.0, &reservoir, &rows_done).unwrap();
        let results = reservoir.into_results().unwrap();
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.sample_i < r.sample_j));
        assert_eq!(rows_done.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn row_ranges_tile_the_full_triangle() {
        let sample = (vec![0xf0u64], vec![0u64]);
        let matrix = GenotypeMatrix::from_samples(&vec![sample; 6]).unwrap();
        let mut pairs = Vec::new();
        for rows in [0..2, 2..3, 3..6] {
            let reservoir = Reservoir::with_capacity(100).unwrap();
            compute_relatedness(&matrix, rows, 0.0, &reservoir, &AtomicU64::new(0)).unwrap();
            pairs.extend(
                reservoir
                    .into_results()
                    .unwrap()
                    .into_iter()
                    .map(|r| (r.sample_i.0, r.sample_j.0)),
            );
        }
        pairs.sort_unstable();
        let expected: Vec<_> = (0..6u32)
            .flat_map(|i| (i + 1..6).map(move |j| (i, j)))
            .collect();
        assert_eq!(pairs, expected);
    }

    #[test]
    fn out_of_bounds_range_is_rejected() {
        let matrix = GenotypeMatrix::from_samples(&[(vec![1], vec![0])]).unwrap();
        let reservoir = Reservoir::with_capacity(1).unwrap();
        let err = compute_relatedness(&matrix, 0..2, 0.0, &reservoir, &AtomicU64::new(0));
        assert!(matches!(err, Err(PipelineError::Config(_))));
    }
}
