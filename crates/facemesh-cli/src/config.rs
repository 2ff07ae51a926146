use anyhow::{bail, Context, Result};
use facemesh_core::matcher::{
    DEFAULT_AVG_WEIGHT, DEFAULT_CONSISTENCY_THRESHOLD, DEFAULT_MAX_WEIGHT,
    DEFAULT_POSITIVE_THRESHOLD, DEFAULT_REPORT_THRESHOLD, DEFAULT_TOP_K,
};
use facemesh_core::quality::QualityWeights;
use facemesh_core::{MatchWeights, QualityConfig, QualityGate, QualityPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Store-wide feature vector length used when nothing else is configured.
pub const DEFAULT_DIMENSION: usize = 24;

/// Effective configuration: TOML file, then `FACEMESH_*` overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub matching: MatchingSection,
    pub quality: QualitySection,
    pub enrollment: EnrollmentSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Directory holding the metadata and template artifacts.
    pub data_dir: PathBuf,
    pub dimension: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dimension: DEFAULT_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSection {
    pub w_max: f32,
    pub w_avg: f32,
    /// Candidates below this confidence are not reported.
    pub report_threshold: f32,
    /// Confidence at or above which a candidate counts as a positive match.
    pub positive_threshold: f32,
    pub top_k: usize,
}

impl Default for MatchingSection {
    fn default() -> Self {
        Self {
            w_max: DEFAULT_MAX_WEIGHT,
            w_avg: DEFAULT_AVG_WEIGHT,
            report_threshold: DEFAULT_REPORT_THRESHOLD,
            positive_threshold: DEFAULT_POSITIVE_THRESHOLD,
            top_k: DEFAULT_TOP_K,
        }
    }
}

impl MatchingSection {
    pub fn weights(&self) -> Result<MatchWeights> {
        MatchWeights::new(self.w_max, self.w_avg).context("invalid [matching] weights")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySection {
    pub brightness_min: f32,
    pub brightness_max: f32,
    pub sharpness_norm: f32,
    pub contrast_norm: f32,
    pub min_score: f32,
    pub policy: QualityPolicy,
    pub weights: QualityWeights,
}

impl Default for QualitySection {
    fn default() -> Self {
        let assessor = QualityConfig::default();
        let gate = QualityGate::default();
        Self {
            brightness_min: assessor.brightness_min,
            brightness_max: assessor.brightness_max,
            sharpness_norm: assessor.sharpness_norm,
            contrast_norm: assessor.contrast_norm,
            min_score: gate.min_score,
            policy: gate.policy,
            weights: assessor.weights,
        }
    }
}

impl QualitySection {
    pub fn assessor_config(&self) -> QualityConfig {
        QualityConfig {
            brightness_min: self.brightness_min,
            brightness_max: self.brightness_max,
            sharpness_norm: self.sharpness_norm,
            contrast_norm: self.contrast_norm,
            weights: self.weights,
        }
    }

    pub fn gate(&self) -> QualityGate {
        QualityGate {
            min_score: self.min_score,
            policy: self.policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentSection {
    /// Minimum pairwise cosine similarity between samples added together.
    pub consistency_threshold: f32,
}

impl Default for EnrollmentSection {
    fn default() -> Self {
        Self {
            consistency_threshold: DEFAULT_CONSISTENCY_THRESHOLD,
        }
    }
}

impl Config {
    /// Load the configuration file and apply `FACEMESH_*` environment overrides.
    ///
    /// An explicitly named file must exist; the default location may be absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var("FACEMESH_CONFIG") {
                Ok(p) => (PathBuf::from(p), true),
                Err(_) => (default_config_path(), false),
            },
        };

        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config file {}", path.display()))
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    ///
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACEMESH_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        self.store.dimension = env_usize(&lookup, "FACEMESH_DIMENSION", self.store.dimension);

        let m = &mut self.matching;
        m.report_threshold = env_f32(&lookup, "FACEMESH_REPORT_THRESHOLD", m.report_threshold);
        m.positive_threshold =
            env_f32(&lookup, "FACEMESH_POSITIVE_THRESHOLD", m.positive_threshold);
        m.top_k = env_usize(&lookup, "FACEMESH_TOP_K", m.top_k);

        let q = &mut self.quality;
        q.min_score = env_f32(&lookup, "FACEMESH_MIN_QUALITY", q.min_score);
        q.policy = match lookup("FACEMESH_QUALITY_POLICY")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("reject") => QualityPolicy::Reject,
            Some("warn") => QualityPolicy::Warn,
            _ => q.policy,
        };
    }

    /// Reject settings the engine would refuse, before touching the store.
    pub fn validate(&self) -> Result<()> {
        if self.store.dimension == 0 {
            bail!("[store] dimension must be positive");
        }
        self.matching.weights()?;
        for (name, value) in [
            ("report_threshold", self.matching.report_threshold),
            ("positive_threshold", self.matching.positive_threshold),
        ] {
            if !value.is_finite() {
                bail!("[matching] {name} must be a finite number, got {value}");
            }
        }
        self.quality
            .assessor_config()
            .validate()
            .context("invalid [quality] settings")?;
        if !(0.0..=1.0).contains(&self.quality.min_score) {
            bail!(
                "[quality] min_score must be within [0, 1], got {}",
                self.quality.min_score
            );
        }
        let c = self.enrollment.consistency_threshold;
        if !(-1.0..=1.0).contains(&c) {
            bail!("[enrollment] consistency_threshold must be within [-1, 1], got {c}");
        }
        Ok(())
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("facemesh")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("facemesh/config.toml")
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.store.dimension, 24);
        assert!((c.matching.w_max - 0.7).abs() < 1e-6);
        assert!((c.matching.w_avg - 0.3).abs() < 1e-6);
        assert!((c.matching.report_threshold - 0.5).abs() < 1e-6);
        assert!((c.matching.positive_threshold - 0.75).abs() < 1e-6);
        assert_eq!(c.matching.top_k, 5);
        assert_eq!(c.quality.policy, QualityPolicy::Warn);
        assert!((c.enrollment.consistency_threshold - 0.65).abs() < 1e-6);
        c.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = Config::from_toml(
            r#"
            [store]
            dimension = 128

            [matching]
            top_k = 3

            [quality]
            policy = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(c.store.dimension, 128);
        assert_eq!(c.matching.top_k, 3);
        assert!((c.matching.w_max - 0.7).abs() < 1e-6);
        assert_eq!(c.quality.policy, QualityPolicy::Reject);
        assert!((c.quality.brightness_min - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut c = Config::default();
        c.store.data_dir = PathBuf::from("/var/lib/facemesh");
        c.quality.weights.sharpness = 0.5;
        c.quality.weights.contrast = 0.2;
        let text = c.to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), c);
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_env(vars(&[
            ("FACEMESH_DATA_DIR", "/srv/faces"),
            ("FACEMESH_DIMENSION", "512"),
            ("FACEMESH_POSITIVE_THRESHOLD", "0.9"),
            ("FACEMESH_TOP_K", " 10 "),
            ("FACEMESH_QUALITY_POLICY", "REJECT"),
        ]));
        assert_eq!(c.store.data_dir, PathBuf::from("/srv/faces"));
        assert_eq!(c.store.dimension, 512);
        assert!((c.matching.positive_threshold - 0.9).abs() < 1e-6);
        assert_eq!(c.matching.top_k, 10);
        assert_eq!(c.quality.policy, QualityPolicy::Reject);
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let mut c = Config::default();
        c.apply_env(vars(&[
            ("FACEMESH_DIMENSION", "lots"),
            ("FACEMESH_REPORT_THRESHOLD", "high"),
            ("FACEMESH_QUALITY_POLICY", "maybe"),
        ]));
        assert_eq!(c, Config::default());
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut c = Config::default();
        c.matching.w_max = 0.9;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_dimension() {
        let mut c = Config::default();
        c.store.dimension = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_quality_band() {
        let mut c = Config::default();
        c.quality.brightness_min = 200.0;
        c.quality.brightness_max = 100.0;
        assert!(c.validate().is_err());
    }
}
