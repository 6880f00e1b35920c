//! Topic embedding vectors and the similarity measure the matcher runs on.

use serde::{Deserialize, Serialize};

use crate::error::EmbeddingError;

/// A fixed-length float vector produced by the external embedding service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        Ok(Self(values))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Cosine similarity in [-1, 1]. Mismatched dimensions or a zero-norm
    /// vector yield 0.0 (no meaningful similarity).
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.0.len() != other.0.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot / (norm_a.sqrt() * norm_b.sqrt())
    }

    /// Encode as little-endian f32 bytes for blob storage.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for v in &self.0 {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Decode from little-endian f32 bytes.
    pub fn from_blob(data: &[u8]) -> Result<Self, EmbeddingError> {
        if data.is_empty() || data.len() % 4 != 0 {
            return Err(EmbeddingError::InvalidBlob(data.len()));
        }
        let values = data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_is_one() {
        let e = Embedding::new(vec![0.5, 0.25, -0.1]).unwrap();
        assert!((e.cosine_similarity(&e) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = Embedding::new(vec![1.0, 0.0]).unwrap();
        let b = Embedding::new(vec![0.0, 1.0]).unwrap();
        assert!(a.cosine_similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn cosine_opposite_is_negative_one() {
        let a = Embedding::new(vec![1.0, 1.0]).unwrap();
        let b = Embedding::new(vec![-1.0, -1.0]).unwrap();
        assert!((a.cosine_similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_dimension_mismatch_is_zero() {
        let a = Embedding::new(vec![1.0, 0.0]).unwrap();
        let b = Embedding::new(vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(a.cosine_similarity(&b), 0.0);
    }

    #[test]
    fn blob_roundtrip() {
        let e = Embedding::new(vec![0.1, -2.5, 1000.0, f32::MIN_POSITIVE]).unwrap();
        let restored = Embedding::from_blob(&e.to_blob()).unwrap();
        assert_eq!(e, restored);
    }

    #[test]
    fn blob_rejects_truncated_data() {
        assert!(Embedding::from_blob(&[1, 2, 3]).is_err());
        assert!(Embedding::from_blob(&[]).is_err());
    }
}
