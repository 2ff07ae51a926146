//! Per-identity aggregation and ranking of cosine similarities.

use crate::error::CoreError;
use crate::types::{FeatureVector, MatchCandidate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_MAX_WEIGHT: f32 = 0.7;
pub const DEFAULT_AVG_WEIGHT: f32 = 0.3;
/// Minimum confidence for a candidate to appear in results at all.
pub const DEFAULT_REPORT_THRESHOLD: f32 = 0.5;
/// Conventional caller-side acceptance threshold.
pub const DEFAULT_POSITIVE_THRESHOLD: f32 = 0.75;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_CONSISTENCY_THRESHOLD: f32 = 0.65;

const WEIGHT_SUM_TOLERANCE: f32 = 1e-6;

/// Weights of the max/avg similarity aggregates in the confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchWeights {
    #[serde(rename = "w_max")]
    pub max: f32,
    #[serde(rename = "w_avg")]
    pub avg: f32,
}

impl MatchWeights {
    pub fn new(max: f32, avg: f32) -> Result<Self, CoreError> {
        let weights = Self { max, avg };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let in_range = |w: f32| w.is_finite() && (0.0..=1.0).contains(&w);
        if !in_range(self.max)
            || !in_range(self.avg)
            || ((self.max + self.avg) - 1.0).abs() > WEIGHT_SUM_TOLERANCE
        {
            return Err(CoreError::InvalidWeights {
                max: self.max,
                avg: self.avg,
            });
        }
        Ok(())
    }

    /// `w_max * max + w_avg * avg`, kept inside [-1, 1].
    pub fn confidence(&self, max_similarity: f32, avg_similarity: f32) -> f32 {
        (self.max * max_similarity + self.avg * avg_similarity).clamp(-1.0, 1.0)
    }
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX_WEIGHT,
            avg: DEFAULT_AVG_WEIGHT,
        }
    }
}

/// Parameters of a single 1:N query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchQuery {
    pub top_k: usize,
    pub report_threshold: f32,
}

impl Default for MatchQuery {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            report_threshold: DEFAULT_REPORT_THRESHOLD,
        }
    }
}

/// Max and mean of one identity's template similarities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityAggregate {
    pub max: f32,
    pub avg: f32,
    pub count: usize,
}

/// One identity's templates, borrowed from whatever owns them.
#[derive(Debug, Clone, Copy)]
pub struct GalleryEntry<'a, T> {
    pub identity_id: &'a str,
    pub templates: &'a [T],
}

/// Strategy for ranking enrolled identities against a probe.
pub trait Matcher {
    /// Dimensionality every probe and template must have.
    fn dimension(&self) -> usize;

    /// Aggregate similarities of `probe` against `templates`; `None` when empty.
    fn aggregate<T: AsRef<FeatureVector>>(
        &self,
        probe: &FeatureVector,
        templates: &[T],
    ) -> Option<SimilarityAggregate>;

    fn confidence(&self, aggregate: &SimilarityAggregate) -> f32;

    /// Score a single identity. `None` when it holds no templates.
    fn score<T: AsRef<FeatureVector>>(
        &self,
        probe: &FeatureVector,
        entry: &GalleryEntry<'_, T>,
    ) -> Result<Option<MatchCandidate>, CoreError> {
        probe.ensure_dimension(self.dimension())?;
        Ok(self
            .aggregate(probe, entry.templates)
            .map(|agg| MatchCandidate {
                identity_id: entry.identity_id.to_string(),
                max_similarity: agg.max,
                avg_similarity: agg.avg,
                confidence: self.confidence(&agg),
                template_count: agg.count,
            }))
    }

    /// Rank the gallery: filter by report threshold, sort by confidence
    /// descending then identity id ascending, keep `top_k`.
    fn rank<T: AsRef<FeatureVector>>(
        &self,
        probe: &FeatureVector,
        gallery: &[GalleryEntry<'_, T>],
        query: &MatchQuery,
    ) -> Result<Vec<MatchCandidate>, CoreError> {
        if query.top_k == 0 {
            return Ok(Vec::new());
        }
        probe.ensure_dimension(self.dimension())?;
        if !query.report_threshold.is_finite() {
            return Err(CoreError::InvalidThreshold(query.report_threshold));
        }

        let mut candidates = Vec::with_capacity(gallery.len());
        for entry in gallery {
            if let Some(candidate) = self.score(probe, entry)? {
                if candidate.confidence >= query.report_threshold {
                    candidates.push(candidate);
                }
            }
        }

        candidates.sort_by(rank_order);
        candidates.truncate(query.top_k);
        Ok(candidates)
    }
}

fn rank_order(a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.identity_id.cmp(&b.identity_id))
}

/// Cosine matcher combining max and mean similarity with fixed weights.
///
/// Quality scores play no part here; they only gate enrollment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedCosineMatcher {
    dimension: usize,
    weights: MatchWeights,
}

impl WeightedCosineMatcher {
    /// Fails fast on a zero dimension or weights that do not sum to 1.
    pub fn new(dimension: usize, weights: MatchWeights) -> Result<Self, CoreError> {
        if dimension == 0 {
            return Err(CoreError::ZeroDimension);
        }
        weights.validate()?;
        Ok(Self { dimension, weights })
    }

    pub fn weights(&self) -> MatchWeights {
        self.weights
    }
}

impl Matcher for WeightedCosineMatcher {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn aggregate<T: AsRef<FeatureVector>>(
        &self,
        probe: &FeatureVector,
        templates: &[T],
    ) -> Option<SimilarityAggregate> {
        if templates.is_empty() {
            return None;
        }

        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f32;
        for template in templates {
            let sim = probe.similarity(template.as_ref()).clamp(-1.0, 1.0);
            max = max.max(sim);
            sum += sim;
        }
        let count = templates.len();

        Some(SimilarityAggregate {
            max,
            avg: (sum / count as f32).clamp(-1.0, 1.0),
            count,
        })
    }

    fn confidence(&self, aggregate: &SimilarityAggregate) -> f32 {
        self.weights.confidence(aggregate.max, aggregate.avg)
    }
}

/// Check that every pair of enrollment samples is at least `min_similarity`
/// alike. Zero or one sample is trivially consistent.
pub fn check_consistency(samples: &[FeatureVector], min_similarity: f32) -> Result<(), CoreError> {
    if !min_similarity.is_finite() {
        return Err(CoreError::InvalidThreshold(min_similarity));
    }
    for (i, a) in samples.iter().enumerate() {
        for (j, b) in samples.iter().enumerate().skip(i + 1) {
            let similarity = a.similarity(b);
            if similarity < min_similarity {
                return Err(CoreError::InconsistentSamples {
                    first: i,
                    second: j,
                    similarity,
                    threshold: min_similarity,
                });
            }
        }
    }
    Ok(())
}
