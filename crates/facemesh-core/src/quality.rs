//! Image quality assessment of sharpness, exposure and contrast on the luminance channel.
//!
//! Pure functions of the input; used to screen candidate images before
//! their feature vectors become templates.

use crate::error::CoreError;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Weights of the three sub-scores in the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub sharpness: f32,
    pub brightness: f32,
    pub contrast: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            sharpness: 0.4,
            brightness: 0.3,
            contrast: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Lower edge of the acceptable mean luminance (0–255).
    pub brightness_min: f32,
    /// Upper edge of the acceptable mean luminance (0–255).
    pub brightness_max: f32,
    /// Laplacian variance that maps to a full sharpness score.
    pub sharpness_norm: f32,
    /// Luminance standard deviation that maps to a full contrast score.
    pub contrast_norm: f32,
    pub weights: QualityWeights,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            brightness_min: 40.0,
            brightness_max: 220.0,
            sharpness_norm: 1000.0,
            contrast_norm: 128.0,
            weights: QualityWeights::default(),
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        let bad = |msg: &str| Err(CoreError::InvalidQualityConfig(msg.to_string()));
        if !(self.brightness_min.is_finite() && self.brightness_max.is_finite())
            || self.brightness_min < 0.0
            || self.brightness_max > 255.0
            || self.brightness_min >= self.brightness_max
        {
            return bad("brightness band must satisfy 0 <= min < max <= 255");
        }
        if !(self.sharpness_norm.is_finite() && self.sharpness_norm > 0.0) {
            return bad("sharpness_norm must be positive");
        }
        if !(self.contrast_norm.is_finite() && self.contrast_norm > 0.0) {
            return bad("contrast_norm must be positive");
        }
        let w = self.weights;
        let all = [w.sharpness, w.brightness, w.contrast];
        if all.iter().any(|x| !x.is_finite() || *x < 0.0) || all.iter().sum::<f32>() <= 0.0 {
            return bad("quality weights must be non-negative with a positive sum");
        }
        Ok(())
    }
}

/// Exposure classification against the configured brightness band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exposure {
    Under,
    Normal,
    Over,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Variance of the Laplacian response; higher means less blur.
    pub sharpness: f32,
    /// Mean luminance (0–255).
    pub brightness: f32,
    /// Standard deviation of luminance.
    pub contrast: f32,
    pub exposure: Exposure,
    pub sharpness_score: f32,
    pub brightness_score: f32,
    pub contrast_score: f32,
    /// Weighted combination of the sub-scores, in [0, 1].
    pub overall_score: f32,
}

/// Scores luminance images for usability as enrollment templates.
#[derive(Debug, Clone, Copy)]
pub struct QualityAssessor {
    config: QualityConfig,
}

impl QualityAssessor {
    pub fn new(config: QualityConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Assess a decoded image by its luminance channel.
    pub fn assess_image(&self, img: &DynamicImage) -> QualityReport {
        let luma = img.to_luma8();
        let (width, height) = luma.dimensions();
        self.score(luma.as_raw(), width, height)
    }

    /// Assess a packed 8-bit grayscale buffer of `width * height` bytes.
    pub fn assess_luma(
        &self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<QualityReport, CoreError> {
        let expected = width as usize * height as usize;
        if gray.len() < expected {
            return Err(CoreError::InvalidImage {
                width,
                height,
                expected,
                actual: gray.len(),
            });
        }
        Ok(self.score(&gray[..expected], width, height))
    }

    fn score(&self, gray: &[u8], width: u32, height: u32) -> QualityReport {
        let cfg = &self.config;
        let sharpness = laplacian_variance(gray, width, height);
        let brightness = mean_luminance(gray);
        let contrast = luminance_stddev(gray);

        let exposure = if brightness < cfg.brightness_min {
            Exposure::Under
        } else if brightness > cfg.brightness_max {
            Exposure::Over
        } else {
            Exposure::Normal
        };

        let sharpness_score = (sharpness / cfg.sharpness_norm).clamp(0.0, 1.0);
        let brightness_score = match exposure {
            Exposure::Normal => {
                let center = (cfg.brightness_min + cfg.brightness_max) / 2.0;
                let half = (cfg.brightness_max - cfg.brightness_min) / 2.0;
                (1.0 - (brightness - center).abs() / half).clamp(0.0, 1.0)
            }
            Exposure::Under | Exposure::Over => 0.0,
        };
        let contrast_score = (contrast / cfg.contrast_norm).clamp(0.0, 1.0);

        let w = cfg.weights;
        let total = w.sharpness + w.brightness + w.contrast;
        let overall_score = ((w.sharpness * sharpness_score
            + w.brightness * brightness_score
            + w.contrast * contrast_score)
            / total)
            .clamp(0.0, 1.0);

        QualityReport {
            sharpness,
            brightness,
            contrast,
            exposure,
            sharpness_score,
            brightness_score,
            contrast_score,
            overall_score,
        }
    }
}

/// Mean pixel luminance (0.0–255.0).
pub fn mean_luminance(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    gray.iter().map(|&b| b as f32).sum::<f32>() / gray.len() as f32
}

/// Population standard deviation of pixel luminance.
pub fn luminance_stddev(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    let n = gray.len() as f32;
    let mean = mean_luminance(gray);
    let variance = gray.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
    variance.sqrt()
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
///
/// Images narrower or shorter than 3 pixels have no interior and score 0.
pub fn laplacian_variance(gray: &[u8], width: u32, height: u32) -> f32 {
    let w = width as usize;
    let h = height as usize;
    if w < 3 || h < 3 || gray.len() < w * h {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray[y * w + x] as f64;
            let lap = gray[(y - 1) * w + x] as f64
                + gray[(y + 1) * w + x] as f64
                + gray[y * w + x - 1] as f64
                + gray[y * w + x + 1] as f64
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }

    let n = count as f64;
    let mean = sum / n;
    ((sum_sq / n) - mean * mean).max(0.0) as f32
}

/// What to do with an image whose quality falls short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPolicy {
    /// Refuse the image.
    Reject,
    /// Accept the image but surface the problem to the caller.
    #[default]
    Warn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QualityVerdict {
    Accept,
    Warn(String),
    Reject(String),
}

/// Turns a [`QualityReport`] into an accept/warn/reject decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGate {
    pub min_score: f32,
    pub policy: QualityPolicy,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_score: 0.5,
            policy: QualityPolicy::Warn,
        }
    }
}

impl QualityGate {
    pub fn evaluate(&self, report: &QualityReport) -> QualityVerdict {
        let mut problems = Vec::new();
        if report.overall_score < self.min_score {
            problems.push(format!(
                "quality score {:.3} below minimum {:.3}",
                report.overall_score, self.min_score
            ));
        }
        match report.exposure {
            Exposure::Under => problems.push(format!(
                "under-exposed (mean luminance {:.1})",
                report.brightness
            )),
            Exposure::Over => problems.push(format!(
                "over-exposed (mean luminance {:.1})",
                report.brightness
            )),
            Exposure::Normal => {}
        }

        if problems.is_empty() {
            return QualityVerdict::Accept;
        }
        let reason = problems.join("; ");
        match self.policy {
            QualityPolicy::Reject => QualityVerdict::Reject(reason),
            QualityPolicy::Warn => QualityVerdict::Warn(reason),
        }
    }
}
