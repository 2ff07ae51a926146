//! facemesh-core: Template matching and image quality assessment.
//!
//! Ranks enrolled identities against a probe feature vector with a
//! weighted max/mean cosine score, and screens candidate images for
//! sharpness, exposure and contrast before they become templates.

pub mod error;
pub mod matcher;
pub mod quality;
pub mod types;

pub use error::CoreError;
pub use matcher::{
    check_consistency, GalleryEntry, MatchQuery, MatchWeights, Matcher, SimilarityAggregate,
    WeightedCosineMatcher,
};
pub use quality::{
    Exposure, QualityAssessor, QualityConfig, QualityGate, QualityPolicy, QualityReport,
    QualityVerdict,
};
pub use types::{is_positive_match, FeatureVector, MatchCandidate};
