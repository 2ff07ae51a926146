use thiserror::Error;

/// Validation failures raised by the pure matching and quality routines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("feature vector is empty")]
    EmptyVector,
    #[error("feature vector holds a non-finite value at index {index}")]
    NonFinite { index: usize },
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("store dimensionality must be at least 1")]
    ZeroDimension,
    #[error("matching weights must be non-negative and sum to 1.0 (w_max={max}, w_avg={avg})")]
    InvalidWeights { max: f32, avg: f32 },
    #[error("threshold must be finite, got {0}")]
    InvalidThreshold(f32),
    #[error(
        "enrollment samples {first} and {second} are inconsistent: similarity {similarity:.3} < {threshold:.3}"
    )]
    InconsistentSamples {
        first: usize,
        second: usize,
        similarity: f32,
        threshold: f32,
    },
    #[error("luminance buffer too short: {width}x{height} needs {expected} bytes, got {actual}")]
    InvalidImage {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("invalid quality configuration: {0}")]
    InvalidQualityConfig(String),
}
