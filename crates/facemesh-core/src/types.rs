use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// Fixed-length geometric description of a face (distances, ratios, angles).
///
/// Always non-empty and finite; construction through [`FeatureVector::new`]
/// (or deserialization) enforces both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Result<Self, CoreError> {
        if values.is_empty() {
            return Err(CoreError::EmptyVector);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(CoreError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Number of components.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn ensure_dimension(&self, expected: usize) -> Result<(), CoreError> {
        if self.values.len() != expected {
            return Err(CoreError::DimensionMismatch {
                expected,
                got: self.values.len(),
            });
        }
        Ok(())
    }

    /// Cosine similarity clamped to [-1, 1].
    ///
    /// A zero-magnitude operand yields 0.0. Always processes every dimension.
    pub fn similarity(&self, other: &FeatureVector) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let sim = if denom > 0.0 { dot / denom } else { 0.0 };
        sim.clamp(-1.0, 1.0)
    }
}

impl TryFrom<Vec<f32>> for FeatureVector {
    type Error = CoreError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FeatureVector> for Vec<f32> {
    fn from(v: FeatureVector) -> Self {
        v.values
    }
}

impl AsRef<FeatureVector> for FeatureVector {
    fn as_ref(&self) -> &FeatureVector {
        self
    }
}

/// One ranked identity produced by a query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub identity_id: String,
    /// Best per-template cosine similarity in [-1, 1].
    pub max_similarity: f32,
    /// Mean per-template cosine similarity in [-1, 1].
    pub avg_similarity: f32,
    pub confidence: f32,
    pub template_count: usize,
}

/// Caller-side acceptance decision. The threshold is inclusive.
pub fn is_positive_match(confidence: f32, positive_threshold: f32) -> bool {
    confidence >= positive_threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn fv(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_rejects_empty_vector() {
        assert_eq!(FeatureVector::new(vec![]), Err(CoreError::EmptyVector));
    }

    #[test]
    fn test_rejects_non_finite() {
        assert_eq!(
            FeatureVector::new(vec![1.0, f32::NAN]),
            Err(CoreError::NonFinite { index: 1 })
        );
        assert_eq!(
            FeatureVector::new(vec![f32::INFINITY]),
            Err(CoreError::NonFinite { index: 0 })
        );
        assert!(FeatureVector::new(vec![0.0, f32::NEG_INFINITY]).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: FeatureVector = serde_json::from_str("[1.0, 2.0]").unwrap();
        assert_eq!(ok.values(), &[1.0, 2.0]);
        assert!(serde_json::from_str::<FeatureVector>("[]").is_err());
    }

    #[test]
    fn test_ensure_dimension() {
        let v = fv(&[1.0, 2.0, 3.0]);
        assert!(v.ensure_dimension(3).is_ok());
        assert_eq!(
            v.ensure_dimension(4),
            Err(CoreError::DimensionMismatch {
                expected: 4,
                got: 3,
            })
        );
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = fv(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = fv(&[1.0, 0.0]);
        let b = fv(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = fv(&[1.0, 0.0]);
        let b = fv(&[-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = fv(&[0.0, 0.0]);
        let b = fv(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(a.similarity(&a), 0.0);
    }

    #[test]
    fn test_cosine_similarity_scale_invariant() {
        let a = fv(&[0.2, 0.4, 0.1]);
        let b = fv(&[2.0, 4.0, 1.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_random_self_and_negated_similarity() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let values: Vec<f32> = (0..24).map(|_| rng.gen_range(-10.0..10.0)).collect();
            if values.iter().all(|v| *v == 0.0) {
                continue;
            }
            let neg: Vec<f32> = values.iter().map(|v| -v).collect();
            let v = fv(&values);
            let n = fv(&neg);
            let self_sim = v.similarity(&v);
            let neg_sim = v.similarity(&n);
            assert!((self_sim - 1.0).abs() < 1e-5, "self similarity {self_sim}");
            assert!((neg_sim + 1.0).abs() < 1e-5, "negated similarity {neg_sim}");
            assert!((-1.0..=1.0).contains(&self_sim));
            assert!((-1.0..=1.0).contains(&neg_sim));
        }
    }

    #[test]
    fn test_positive_match_inclusive() {
        assert!(is_positive_match(0.75, 0.75));
        assert!(is_positive_match(0.9, 0.75));
        assert!(!is_positive_match(0.7499, 0.75));
    }
}
