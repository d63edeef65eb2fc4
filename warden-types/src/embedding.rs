use serde::{Deserialize, Serialize};

use crate::WardenTypesError;

/// Unit-norm appearance vector.
///
/// Construction normalizes and rejects non-finite or zero-norm input, so
/// `dot` of two embeddings is directly their cosine similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn unit_norm(raw: Vec<f32>) -> Result<Self, WardenTypesError> {
        if raw.is_empty() {
            return Err(WardenTypesError::EmptyEmbedding);
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(WardenTypesError::NonFiniteEmbedding);
        }
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-12 {
            return Err(WardenTypesError::ZeroNormEmbedding);
        }
        Ok(Embedding(raw.into_iter().map(|v| v / norm).collect()))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Cosine similarity. Both sides are unit norm, so this is a dot product.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        debug_assert_eq!(self.0.len(), other.0.len());
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Exponentially weighted blend `alpha * self + (1 - alpha) * other`,
    /// re-normalized to unit length.
    ///
    /// Falls back to a copy of `other` in the degenerate case where the blend
    /// cancels to zero (opposite vectors with alpha 0.5).
    pub fn ema(&self, other: &Embedding, alpha: f32) -> Embedding {
        let blended: Vec<f32> = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| alpha * a + (1.0 - alpha) * b)
            .collect();
        Embedding::unit_norm(blended).unwrap_or_else(|_| other.clone())
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = WardenTypesError;
    fn try_from(raw: Vec<f32>) -> Result<Self, Self::Error> {
        Embedding::unit_norm(raw)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(e: Embedding) -> Vec<f32> {
        e.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_unit_norm() {
        let e = Embedding::unit_norm(vec![3.0, 4.0]).unwrap();
        assert_relative_eq!(e.as_slice()[0], 0.6, epsilon = 1e-6);
        assert_relative_eq!(e.as_slice()[1], 0.8, epsilon = 1e-6);
        let norm: f32 = e.as_slice().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rejects_degenerate() {
        assert!(Embedding::unit_norm(vec![]).is_err());
        assert!(Embedding::unit_norm(vec![0.0, 0.0]).is_err());
        assert!(Embedding::unit_norm(vec![1.0, f32::NAN]).is_err());
    }

    #[test]
    fn test_cosine() {
        let a = Embedding::unit_norm(vec![1.0, 0.0]).unwrap();
        let b = Embedding::unit_norm(vec![0.0, 1.0]).unwrap();
        let c = Embedding::unit_norm(vec![2.0, 0.0]).unwrap();
        assert_relative_eq!(a.cosine(&b), 0.0, epsilon = 1e-6);
        assert_relative_eq!(a.cosine(&c), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_ema_stays_unit_norm() {
        let a = Embedding::unit_norm(vec![1.0, 0.0]).unwrap();
        let b = Embedding::unit_norm(vec![0.0, 1.0]).unwrap();
        let blended = a.ema(&b, 0.9);
        let norm: f32 = blended.as_slice().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-5);
        // still closer to a than to b
        assert!(blended.cosine(&a) > blended.cosine(&b));
    }

    #[test]
    fn test_serde_roundtrip_normalizes() {
        let buf = "[3.0, 4.0]";
        let e: Embedding = serde_json::from_str(buf).unwrap();
        assert_relative_eq!(e.as_slice()[0], 0.6, epsilon = 1e-6);
    }
}
