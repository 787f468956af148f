// ========================================================================================
//
//                         THE PER-SAMPLE CONTAINER FORMAT
//
// ========================================================================================
//
// Every sample is stored as one object:
//
//     magic "KING" (4 bytes) | decompressed size (u64, little-endian) | zlib stream
//
// The zlib stream expands to exactly the declared number of bytes: the `het` words
// followed by the `hom_alt` words, each `entries_count` little-endian u64 values.

use crate::pipeline::PipelineError;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

pub const MAGIC: &[u8; 4] = b"KING";
pub const HEADER_LEN: usize = MAGIC.len() + size_of::<u64>();
const WORD_BYTES: usize = size_of::<u64>();
/// Both bit-vectors of a single marker word.
const BYTES_PER_ENTRY: usize = 2 * WORD_BYTES;
/// zlib cannot expand input by more than about 1032:1.
const MAX_EXPANSION_RATIO: usize = 1032;
const EXPANSION_SLACK: usize = 64;

/// A validated, decompressed sample payload. Its length is a non-zero multiple of
/// `BYTES_PER_ENTRY`, so `entries_count` can never be fractional.
#[derive(Debug)]
pub struct DecodedPayload {
    bytes: Vec<u8>,
}

impl DecodedPayload {
    #[inline]
    pub fn entries_count(&self) -> usize {
        self.bytes.len() / BYTES_PER_ENTRY
    }

    /// Iterates the `het` words followed by the `hom_alt` words, in matrix order.
    pub fn words(&self) -> impl ExactSizeIterator<Item = u64> + '_ {
        self.bytes.chunks_exact(WORD_BYTES).map(|chunk| {
            let mut word = [0u8; WORD_BYTES];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
    }

    pub fn into_vectors(self) -> (Vec<u64>, Vec<u64>) {
        let entries = self.entries_count();
        let mut words: Vec<u64> = self.words().collect();
        let hom_alt = words.split_off(entries);
        (words, hom_alt)
    }
}

/// Validates the header of a raw object and expands its payload.
pub fn decode_sample(raw: &[u8]) -> Result<DecodedPayload, PipelineError> {
    if raw.len() < HEADER_LEN {
        return Err(PipelineError::Format(format!(
            "Container is {} bytes, shorter than the {HEADER_LEN}-byte header",
            raw.len()
        )));
    }
    let (magic, rest) = raw.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(PipelineError::Format(format!(
            "Bad magic tag {magic:02x?}; expected {MAGIC:02x?}"
        )));
    }
    let (size_field, payload) = rest.split_at(WORD_BYTES);
    let mut size_bytes = [0u8; WORD_BYTES];
    size_bytes.copy_from_slice(size_field);
    let declared = u64::from_le_bytes(size_bytes);

    let declared = usize::try_from(declared).map_err(|_| {
        PipelineError::Format(format!("Declared size {declared} does not fit in memory"))
    })?;
    if declared == 0 || declared % BYTES_PER_ENTRY != 0 {
        return Err(PipelineError::Format(format!(
            "Declared size {declared} is not a positive multiple of {BYTES_PER_ENTRY} bytes"
        )));
    }
    let expandable = payload
        .len()
        .saturating_mul(MAX_EXPANSION_RATIO)
        .saturating_add(EXPANSION_SLACK);
    if declared > expandable {
        return Err(PipelineError::Format(format!(
            "Declared size {declared} exceeds the {expandable} bytes a {}-byte compressed payload can expand to",
            payload.len()
        )));
    }

    let mut bytes = Vec::new();
    bytes.try_reserve_exact(declared).map_err(|e| {
        PipelineError::Allocation(format!("Cannot allocate {declared} bytes for a sample: {e}"))
    })?;
    // Read one byte past the declared size so an over-long stream is detected.
    let mut decoder = ZlibDecoder::new(payload).take(declared as u64 + 1);
    decoder
        .read_to_end(&mut bytes)
        .map_err(|e| PipelineError::Format(format!("Decompression failed: {e}")))?;
    if bytes.len() != declared {
        let found = if bytes.len() > declared {
            format!("more than {declared}")
        } else {
            bytes.len().to_string()
        };
        return Err(PipelineError::Format(format!(
            "Payload expanded to {found} bytes but the header declares {declared}"
        )));
    }
    Ok(DecodedPayload { bytes })
}

/// Builds a container from a sample's two equal-length bit-vectors.
pub fn encode_sample(het: &[u64], hom_alt: &[u64]) -> Result<Vec<u8>, PipelineError> {
    if het.len() != hom_alt.len() || het.is_empty() {
        return Err(PipelineError::Format(format!(
            "Bit-vectors must be non-empty and of equal length (het={}, hom_alt={})",
            het.len(),
            hom_alt.len()
        )));
    }
    let mut plain = Vec::with_capacity((het.len() + hom_alt.len()) * WORD_BYTES);
    for word in het.iter().chain(hom_alt) {
        plain.extend_from_slice(&word.to_le_bytes());
    }

    let mut out = Vec::with_capacity(HEADER_LEN + plain.len() / 2);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(plain.len() as u64).to_le_bytes());
    let mut encoder = ZlibEncoder::new(out, Compression::default());
    encoder
        .write_all(&plain)
        .map_err(|e| PipelineError::Format(format!("Compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| PipelineError::Format(format!("Compression failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_recovers_both_vectors() {
        let het = vec![0xdead_beef_u64, 0, u64::MAX];
        let hom_alt = vec![1u64, 2, 3];
        let raw = encode_sample(&het, &hom_alt).unwrap();
        assert_eq!(&raw[..4], MAGIC);

        let payload = decode_sample(&raw).unwrap();
        assert_eq!(payload.entries_count(), 3);
        assert_eq!(payload.into_vectors(), (het, hom_alt));
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        let mut raw = encode_sample(&[1], &[2]).unwrap();
        raw[0] = b'X';
        assert!(matches!(decode_sample(&raw), Err(PipelineError::Format(_))));
    }

    #[test]
    fn truncated_header_is_a_format_error() {
        assert!(matches!(decode_sample(b"KING"), Err(PipelineError::Format(_))));
    }

    #[test]
    fn declared_size_mismatch_is_a_format_error() {
        let mut raw = encode_sample(&[1, 2], &[3, 4]).unwrap();
        // Claim one entry fewer than the stream actually holds.
        raw[4..12].copy_from_slice(&16u64.to_le_bytes());
        assert!(matches!(decode_sample(&raw), Err(PipelineError::Format(_))));

        let mut raw = encode_sample(&[1, 2], &[3, 4]).unwrap();
        raw[4..12].copy_from_slice(&48u64.to_le_bytes());
        assert!(matches!(decode_sample(&raw), Err(PipelineError::Format(_))));
    }

    #[test]
    fn implausibly_large_declared_size_is_a_format_error() {
        for declared in [1u64 << 44, 1u64 << 62, u64::MAX - 15] {
            let mut raw = encode_sample(&[1], &[2]).unwrap();
            raw[4..12].copy_from_slice(&declared.to_le_bytes());
            let err = decode_sample(&raw).unwrap_err();
            assert!(matches!(err, PipelineError::Format(_)), "{declared}: {err}");
            assert_eq!(err.exit_code(), 4);
        }
    }

    #[test]
    fn highly_compressible_payload_stays_within_the_expansion_bound() {
        let zeros = vec![0u64; 1 << 15];
        let raw = encode_sample(&zeros, &zeros).unwrap();
        assert_eq!(decode_sample(&raw).unwrap().entries_count(), zeros.len());
    }

    #[test]
    fn size_not_a_multiple_of_an_entry_is_rejected() {
        let mut raw = encode_sample(&[1], &[2]).unwrap();
        raw[4..12].copy_from_slice(&15u64.to_le_bytes());
        assert!(matches!(decode_sample(&raw), Err(PipelineError::Format(_))));
    }

    #[test]
    fn corrupt_stream_is_a_format_error() {
        let mut raw = encode_sample(&[7; 32], &[9; 32]).unwrap();
        // Keep only the header and the two-byte zlib preamble.
        raw.truncate(HEADER_LEN + 2);
        assert!(matches!(decode_sample(&raw), Err(PipelineError::Format(_))));
    }

    #[test]
    fn unequal_vectors_cannot_be_encoded() {
        assert!(encode_sample(&[1, 2], &[3]).is_err());
        assert!(encode_sample(&[], &[]).is_err());
    }
}
