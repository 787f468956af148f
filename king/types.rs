// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use std::fmt;

/// The number of markers packed into one matrix word.
pub const MARKERS_PER_WORD: usize = u64::BITS as usize;

/// An index into the run's ordered sample list (the sample map sorted by id).
///
/// This newtype prevents confusion between sample indices and word offsets at compile
/// time. The `#[repr(transparent)]` attribute guarantees this is a zero-cost abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SampleIndex(pub u32);

impl SampleIndex {
    #[inline(always)]
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SampleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where one sample's container lives. The position of a locator in the reader's
/// input list is the sample's `SampleIndex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleLocator {
    pub id: String,
    pub path: String,
}

/// One thresholded result of the pairwise kernel.
///
/// Only the strict upper triangle is ever produced, so `sample_i < sample_j` holds for
/// every value the kernel writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairResult {
    pub sample_i: SampleIndex,
    pub sample_j: SampleIndex,
    pub coefficient: f32,
}

/// The decoded genotype bit-vectors for a single sample, borrowed from the matrix.
///
/// Both slices have exactly `entries_count` words.
#[derive(Debug, Clone, Copy)]
pub struct SampleBits<'a> {
    pub het: &'a [u64],
    pub hom_alt: &'a [u64],
}

/// A single marker's call, as written by `pack` and recovered by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenotypeCall {
    HomRef,
    Het,
    HomAlt,
    Missing,
}

impl GenotypeCall {
    /// Returns the `(het, hom_alt)` bit pair for this call.
    #[inline]
    pub fn bits(self) -> (bool, bool) {
        match self {
            GenotypeCall::HomRef => (false, false),
            GenotypeCall::Het => (true, false),
            GenotypeCall::HomAlt => (false, true),
            GenotypeCall::Missing => (true, true),
        }
    }

    #[inline]
    pub fn from_bits(het: bool, hom_alt: bool) -> Self {
        match (het, hom_alt) {
            (false, false) => GenotypeCall::HomRef,
            (true, false) => GenotypeCall::Het,
            (false, true) => GenotypeCall::HomAlt,
            (true, true) => GenotypeCall::Missing,
        }
    }

    pub fn from_symbol(symbol: u8) -> Option<Self> {
        match symbol {
            b'0' => Some(GenotypeCall::HomRef),
            b'1' => Some(GenotypeCall::Het),
            b'2' => Some(GenotypeCall::HomAlt),
            b'.' => Some(GenotypeCall::Missing),
            _ => None,
        }
    }
}

/// Packs a run of calls into the two word vectors of a sample.
///
/// Trailing bits of the last word are left as hom-ref, which contributes nothing to
/// any of the kernel's counts.
pub fn pack_calls(calls: &[GenotypeCall]) -> (Vec<u64>, Vec<u64>) {
    let words = calls.len().div_ceil(MARKERS_PER_WORD);
    let mut het = vec![0u64; words];
    let mut hom_alt = vec![0u64; words];
    for (marker, call) in calls.iter().enumerate() {
        let (h, a) = call.bits();
        let word = marker / MARKERS_PER_WORD;
        let bit = 1u64 << (marker % MARKERS_PER_WORD);
        if h {
            het[word] |= bit;
        }
        if a {
            hom_alt[word] |= bit;
        }
    }
    (het, hom_alt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genotype_call_bits_round_trip_through_symbols() {
        for symbol in [b'0', b'1', b'2', b'.'] {
            let call = GenotypeCall::from_symbol(symbol).unwrap();
            let (het, hom_alt) = call.bits();
            assert_eq!(GenotypeCall::from_bits(het, hom_alt), call);
        }
        assert!(GenotypeCall::from_symbol(b'3').is_none());
    }

    #[test]
    fn pack_calls_places_markers_across_word_boundaries() {
        let mut calls = vec![GenotypeCall::HomRef; 70];
        calls[0] = GenotypeCall::Het;
        calls[64] = GenotypeCall::HomAlt;
        calls[69] = GenotypeCall::Missing;

        let (het, hom_alt) = pack_calls(&calls);
        assert_eq!(het.len(), 2);
        assert_eq!(het[0], 1);
        assert_eq!(hom_alt[1], 1 | (1 << 5));
        assert_eq!(het[1], 1 << 5);
    }
}
