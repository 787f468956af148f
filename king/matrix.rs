// ========================================================================================
//
//                          THE GENOTYPE BIT-SET MATRIX
//
// ========================================================================================
//
// All samples' bit-vectors live back to back in one contiguous buffer of
// `num_samples * 2 * entries_count` words. Sample `s` owns the word range
// `[s * 2E, (s + 1) * 2E)`: `het` first, then `hom_alt`.
//
// The matrix has two forms. `PendingMatrix` is the shared, writable form used during
// ingestion: concurrent readers each fill their own disjoint region without a lock.
// `GenotypeMatrix` is the owned, immutable form handed to the kernel once every reader
// has finished. The kernel borrows it, so it cannot be released while the kernel runs.

use crate::container::DecodedPayload;
use crate::pipeline::PipelineError;
use crate::types::{SampleBits, SampleIndex};
use std::sync::atomic::{AtomicU64, Ordering};

fn checked_len(num_samples: usize, entries_count: usize) -> Result<usize, PipelineError> {
    num_samples
        .checked_mul(entries_count)
        .and_then(|n| n.checked_mul(2))
        .ok_or_else(|| {
            PipelineError::Allocation(format!(
                "Matrix of {num_samples} samples x {entries_count} entries overflows the address space"
            ))
        })
}

/// The ingestion-time matrix. Regions are written with relaxed atomic stores; the
/// rendezvous that ends ingestion publishes them to whoever calls `into_matrix`.
#[derive(Debug)]
pub struct PendingMatrix {
    words: Box<[AtomicU64]>,
    num_samples: usize,
    entries_count: usize,
}

impl PendingMatrix {
    /// Allocates a zeroed matrix, reporting allocation failure instead of aborting.
    pub fn allocate(num_samples: usize, entries_count: usize) -> Result<Self, PipelineError> {
        let len = checked_len(num_samples, entries_count)?;
        let mut words = Vec::new();
        words.try_reserve_exact(len).map_err(|e| {
            PipelineError::Allocation(format!(
                "Cannot allocate {} MiB for the genotype matrix: {e}",
                (len * size_of::<u64>()) >> 20
            ))
        })?;
        words.resize_with(len, || AtomicU64::new(0));
        Ok(Self {
            words: words.into_boxed_slice(),
            num_samples,
            entries_count,
        })
    }

    #[inline]
    pub fn entries_count(&self) -> usize {
        self.entries_count
    }

    /// Copies a decoded payload into the sample's pre-assigned region.
    ///
    /// Each sample index is written by exactly one task, so regions never overlap.
    pub fn write_sample(
        &self,
        sample: SampleIndex,
        payload: &DecodedPayload,
    ) -> Result<(), PipelineError> {
        if payload.entries_count() != self.entries_count {
            return Err(PipelineError::Format(format!(
                "Sample {sample} has {} entries but the run established {}",
                payload.entries_count(),
                self.entries_count
            )));
        }
        if sample.get() >= self.num_samples {
            return Err(PipelineError::Format(format!(
                "Sample {sample} is outside a matrix of {} samples",
                self.num_samples
            )));
        }
        let stride = 2 * self.entries_count;
        let region = &self.words[sample.get() * stride..(sample.get() + 1) * stride];
        for (slot, word) in region.iter().zip(payload.words()) {
            slot.store(word, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Converts into the kernel's immutable form. Only callable once every writer has
    /// dropped its handle, which is what makes the conversion free of data races.
    pub fn into_matrix(self) -> GenotypeMatrix {
        let words: Vec<u64> = self
            .words
            .into_vec()
            .into_iter()
            .map(AtomicU64::into_inner)
            .collect();
        GenotypeMatrix {
            words,
            num_samples: self.num_samples,
            entries_count: self.entries_count,
        }
    }
}

/// The decoded, contiguous genotype matrix consumed by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenotypeMatrix {
    words: Vec<u64>,
    num_samples: usize,
    entries_count: usize,
}

impl GenotypeMatrix {
    /// Builds a matrix from already-packed samples. Every sample must have the same,
    /// non-zero number of words in both vectors.
    pub fn from_samples(samples: &[(Vec<u64>, Vec<u64>)]) -> Result<Self, PipelineError> {
        let entries_count = samples.first().map_or(0, |(het, _)| het.len());
        if entries_count == 0 {
            return Err(PipelineError::Format(
                "A matrix needs at least one sample with at least one entry".to_string(),
            ));
        }
        let mut words = Vec::new();
        words
            .try_reserve_exact(checked_len(samples.len(), entries_count)?)
            .map_err(|e| PipelineError::Allocation(format!("Cannot allocate matrix: {e}")))?;
        for (idx, (het, hom_alt)) in samples.iter().enumerate() {
            if het.len() != entries_count || hom_alt.len() != entries_count {
                return Err(PipelineError::Format(format!(
                    "Sample #{idx} has {}/{} words but the matrix uses {entries_count}",
                    het.len(),
                    hom_alt.len()
                )));
            }
            words.extend_from_slice(het);
            words.extend_from_slice(hom_alt);
        }
        Ok(Self {
            words,
            num_samples: samples.len(),
            entries_count,
        })
    }

    #[inline(always)]
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    #[inline(always)]
    pub fn entries_count(&self) -> usize {
        self.entries_count
    }

    #[inline(always)]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Borrows one sample's two bit-vectors.
    ///
    /// # Panics
    /// If `sample` is not below `num_samples`.
    #[inline(always)]
    pub fn sample(&self, sample: usize) -> SampleBits<'_> {
        let stride = 2 * self.entries_count;
        let region = &self.words[sample * stride..(sample + 1) * stride];
        let (het, hom_alt) = region.split_at(self.entries_count);
        SampleBits { het, hom_alt }
    }
}
