use chrono::{DateTime, Utc};
use facemesh_core::FeatureVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One stored feature vector. Immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub vector: FeatureVector,
    /// Quality score in [0, 1] assigned when the source image was screened.
    pub quality_score: f32,
    /// Opaque source tag (capture device, file name, ...).
    pub provenance: String,
    pub created_at: DateTime<Utc>,
}

impl AsRef<FeatureVector> for Template {
    fn as_ref(&self) -> &FeatureVector {
        &self.vector
    }
}

/// An enrolled person and their templates in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub consent_granted: bool,
    pub created_at: DateTime<Utc>,
    pub templates: Vec<Template>,
}

impl Identity {
    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            template_count: self.templates.len(),
            consent_granted: self.consent_granted,
            created_at: self.created_at,
        }
    }
}

/// Descriptive attributes kept outside the matching schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// A template waiting to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTemplate {
    pub vector: FeatureVector,
    pub quality_score: f32,
    pub provenance: String,
}

impl NewTemplate {
    pub fn new(vector: FeatureVector, quality_score: f32, provenance: impl Into<String>) -> Self {
        Self {
            vector,
            quality_score,
            provenance: provenance.into(),
        }
    }
}

/// Whether `enroll` may modify an existing identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnrollMode {
    /// Fail with `Duplicate` if the id exists.
    #[default]
    Create,
    /// Create, or update the display name of an existing identity.
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: String,
    pub display_name: String,
    pub template_count: usize,
    pub consent_granted: bool,
    pub created_at: DateTime<Utc>,
}

/// Template metadata without the feature numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub position: usize,
    pub quality_score: f32,
    pub provenance: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub dimension: usize,
    pub total_identities: usize,
    pub total_templates: usize,
    pub avg_templates_per_identity: f64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Full in-memory contents of a store; what the codec persists.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreState {
    pub dimension: usize,
    /// Incremented on every commit; names the template artifact.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub identities: BTreeMap<String, Identity>,
    pub profiles: BTreeMap<String, Profile>,
}

impl StoreState {
    pub fn empty(dimension: usize) -> Self {
        let now = Utc::now();
        Self {
            dimension,
            generation: 0,
            created_at: now,
            last_modified: now,
            identities: BTreeMap::new(),
            profiles: BTreeMap::new(),
        }
    }

    pub fn total_templates(&self) -> usize {
        self.identities.values().map(|i| i.templates.len()).sum()
    }

    pub fn stats(&self) -> StoreStats {
        let total_identities = self.identities.len();
        let total_templates = self.total_templates();
        let avg_templates_per_identity = if total_identities > 0 {
            total_templates as f64 / total_identities as f64
        } else {
            0.0
        };
        StoreStats {
            dimension: self.dimension,
            total_identities,
            total_templates,
            avg_templates_per_identity,
            created_at: self.created_at,
            last_modified: self.last_modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(values: &[f32]) -> Template {
        Template {
            vector: FeatureVector::new(values.to_vec()).unwrap(),
            quality_score: 0.9,
            provenance: "test".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_stats_empty_store() {
        let stats = StoreState::empty(3).stats();
        assert_eq!(stats.total_identities, 0);
        assert_eq!(stats.total_templates, 0);
        assert_eq!(stats.avg_templates_per_identity, 0.0);
        assert_eq!(stats.dimension, 3);
    }

    #[test]
    fn test_stats_average() {
        let mut state = StoreState::empty(2);
        for (id, n) in [("a", 1usize), ("b", 2), ("c", 0)] {
            state.identities.insert(
                id.to_string(),
                Identity {
                    id: id.to_string(),
                    display_name: id.to_uppercase(),
                    consent_granted: true,
                    created_at: Utc::now(),
                    templates: (0..n).map(|_| template(&[1.0, 0.0])).collect(),
                },
            );
        }
        let stats = state.stats();
        assert_eq!(stats.total_identities, 3);
        assert_eq!(stats.total_templates, 3);
        assert!((stats.avg_templates_per_identity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_counts_templates() {
        let identity = Identity {
            id: "a".into(),
            display_name: "Alice".into(),
            consent_granted: true,
            created_at: Utc::now(),
            templates: vec![template(&[1.0]), template(&[0.5])],
        };
        let summary = identity.summary();
        assert_eq!(summary.template_count, 2);
        assert_eq!(summary.display_name, "Alice");
    }
}
