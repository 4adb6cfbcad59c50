//! Content hashing and the embedding vector codec.
use crate::errors::{MemodexError, Result};
use sha2::{Digest, Sha256};

/// Byte width of a content hash.
pub const HASH_LEN: usize = 32;

/// SHA-256 digest of the text's UTF-8 bytes. The content-addressed identity
/// for embeddings, projections, chunks, and stored text.
pub fn content_hash(text: &str) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

/// Serialize an embedding vector to little-endian f32 bytes for BLOB storage.
pub fn serialize_vector(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for &val in v {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserialize an embedding from little-endian f32 bytes. The element count
/// is inferred from the blob length; trailing bytes that do not form a whole
/// f32 are ignored.
pub fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Cosine similarity between two vectors of equal length.
///
/// Accumulates in f64 for stability at high dimensionality. A zero-magnitude
/// operand yields 0.0. Mismatched lengths are a validation error: under a
/// single bound service they indicate corrupted storage or a caller bug.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(MemodexError::Validation(format!(
            "cosine dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32)
}
