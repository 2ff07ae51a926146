//! The template store: enrolled identities, their templates, and queries.
//!
//! A single readers-writer lock guards the in-memory state. Readers share
//! it; a writer holds it exclusively across both the mutation and the
//! flush. Mutations are applied to a copy which only replaces the live
//! state once the backend has committed it, so a failed flush leaves
//! memory exactly as it was.

use crate::backend::{ArtifactBackend, FsBackend, MemoryBackend};
use crate::codec;
use crate::error::StoreError;
use crate::model::{
    EnrollMode, Identity, IdentitySummary, NewTemplate, Profile, StoreState, StoreStats,
    Template, TemplateInfo,
};
use chrono::Utc;
use facemesh_core::{
    FeatureVector, GalleryEntry, MatchCandidate, MatchQuery, MatchWeights, Matcher,
    WeightedCosineMatcher,
};
use parking_lot::RwLock;
use std::path::PathBuf;

/// Parameters fixed for the lifetime of a store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreOptions {
    /// Store-wide feature vector length.
    pub dimension: usize,
    pub weights: MatchWeights,
}

impl StoreOptions {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            weights: MatchWeights::default(),
        }
    }
}

pub struct TemplateStore {
    backend: Box<dyn ArtifactBackend>,
    matcher: WeightedCosineMatcher,
    state: RwLock<StoreState>,
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore")
            .field("matcher", &self.matcher)
            .field("identities", &self.state.read().identities.len())
            .finish_non_exhaustive()
    }
}

fn validate_id(identity_id: &str) -> Result<(), StoreError> {
    if identity_id.trim().is_empty() {
        return Err(StoreError::validation("identity id must not be empty"));
    }
    if identity_id.chars().any(char::is_control) {
        return Err(StoreError::validation(
            "identity id must not contain control characters",
        ));
    }
    Ok(())
}

fn validate_template(dimension: usize, template: &NewTemplate) -> Result<(), StoreError> {
    template.vector.ensure_dimension(dimension)?;
    if !(template.quality_score.is_finite() && (0.0..=1.0).contains(&template.quality_score)) {
        return Err(StoreError::validation(format!(
            "quality score must be within [0, 1], got {}",
            template.quality_score
        )));
    }
    Ok(())
}

impl TemplateStore {
    /// Open (or create) a store in `dir`.
    pub fn open(dir: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, StoreError> {
        Self::with_backend(Box::new(FsBackend::new(dir)), options)
    }

    /// A store that never touches the filesystem.
    pub fn in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        Self::with_backend(Box::new(MemoryBackend::new()), options)
    }

    /// Build a store over `backend`, loading whatever it has committed.
    ///
    /// Fails with `Validation` for bad options and `CorruptStore` if the
    /// committed artifacts do not validate.
    pub fn with_backend(
        backend: Box<dyn ArtifactBackend>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let matcher = WeightedCosineMatcher::new(options.dimension, options.weights)?;
        let state = Self::read_state(backend.as_ref(), options.dimension)?;

        tracing::info!(
            dimension = state.dimension,
            identities = state.identities.len(),
            templates = state.total_templates(),
            generation = state.generation,
            "template store opened"
        );

        Ok(Self {
            backend,
            matcher,
            state: RwLock::new(state),
        })
    }

    fn read_state(
        backend: &dyn ArtifactBackend,
        dimension: usize,
    ) -> Result<StoreState, StoreError> {
        let Some(pair) = backend.read()? else {
            return Ok(StoreState::empty(dimension));
        };
        let state = codec::deserialize(&pair.metadata, &pair.templates).map_err(|e| {
            tracing::warn!(error = %e, "persisted store failed validation");
            e
        })?;
        if state.dimension != dimension {
            tracing::warn!(
                persisted = state.dimension,
                configured = dimension,
                "persisted store has a different dimensionality"
            );
            return Err(StoreError::corrupt(format!(
                "persisted dimensionality {} does not match configured {dimension}",
                state.dimension
            )));
        }
        Ok(state)
    }

    pub fn dimension(&self) -> usize {
        self.matcher.dimension()
    }

    pub fn weights(&self) -> MatchWeights {
        self.matcher.weights()
    }

    /// Replace the in-memory state with what the backend has committed.
    pub fn load(&self) -> Result<(), StoreError> {
        let mut guard = self.state.write();
        *guard = Self::read_state(self.backend.as_ref(), self.dimension())?;
        Ok(())
    }

    /// Write the current state to durable storage.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.commit("flush", |_| Ok(()))
    }

    /// Final flush, then release the store.
    pub fn close(self) -> Result<(), StoreError> {
        self.flush()?;
        tracing::info!("template store closed");
        Ok(())
    }

    /// Apply `mutate` to a copy of the state, persist it, then publish it.
    fn commit<F>(&self, op: &'static str, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<(), StoreError>,
    {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        mutate(&mut next)?;
        next.generation += 1;
        next.last_modified = Utc::now();

        let artifacts = codec::serialize(&next)?;
        self.backend.commit(&artifacts)?;

        tracing::debug!(
            op,
            generation = next.generation,
            identities = next.identities.len(),
            templates = next.total_templates(),
            "store mutation committed"
        );
        *guard = next;
        Ok(())
    }

    /// Create an identity, or update its display name under `EnrollMode::Update`.
    ///
    /// Consent is required at write time; `consent_granted = false` is a
    /// `Validation` error in either mode.
    pub fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        consent_granted: bool,
        mode: EnrollMode,
    ) -> Result<(), StoreError> {
        validate_id(identity_id)?;
        if !consent_granted {
            return Err(StoreError::validation(format!(
                "consent is required to enroll {identity_id}"
            )));
        }

        self.commit("enroll", |state| {
            match state.identities.get_mut(identity_id) {
                Some(_) if mode == EnrollMode::Create => {
                    Err(StoreError::Duplicate(identity_id.to_string()))
                }
                Some(existing) => {
                    existing.display_name = display_name.to_string();
                    existing.consent_granted = true;
                    Ok(())
                }
                None => {
                    state.identities.insert(
                        identity_id.to_string(),
                        Identity {
                            id: identity_id.to_string(),
                            display_name: display_name.to_string(),
                            consent_granted: true,
                            created_at: Utc::now(),
                            templates: Vec::new(),
                        },
                    );
                    Ok(())
                }
            }
        })?;

        tracing::info!(identity = identity_id, ?mode, "identity enrolled");
        Ok(())
    }

    /// Append one template to an identity.
    pub fn add_template(
        &self,
        identity_id: &str,
        vector: FeatureVector,
        quality_score: f32,
        provenance: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.add_templates(
            identity_id,
            vec![NewTemplate::new(vector, quality_score, provenance)],
        )
    }

    /// Append several templates at once; either all are stored or none.
    pub fn add_templates(
        &self,
        identity_id: &str,
        templates: Vec<NewTemplate>,
    ) -> Result<(), StoreError> {
        let dimension = self.dimension();
        let count = templates.len();

        self.commit("add_template", |state| {
            let identity = state
                .identities
                .get_mut(identity_id)
                .ok_or_else(|| StoreError::NotFound(identity_id.to_string()))?;
            if !identity.consent_granted {
                return Err(StoreError::validation(format!(
                    "identity {identity_id} has not granted consent"
                )));
            }
            for template in &templates {
                validate_template(dimension, template)?;
            }
            let now = Utc::now();
            identity
                .templates
                .extend(templates.into_iter().map(|t| Template {
                    vector: t.vector,
                    quality_score: t.quality_score,
                    provenance: t.provenance,
                    created_at: now,
                }));
            Ok(())
        })?;

        tracing::info!(identity = identity_id, added = count, "templates stored");
        Ok(())
    }

    /// Delete an identity, its templates and its profile. Irreversible.
    pub fn remove_identity(&self, identity_id: &str) -> Result<(), StoreError> {
        self.commit("remove_identity", |state| {
            state
                .identities
                .remove(identity_id)
                .ok_or_else(|| StoreError::NotFound(identity_id.to_string()))?;
            state.profiles.remove(identity_id);
            Ok(())
        })?;

        tracing::info!(identity = identity_id, "identity removed");
        Ok(())
    }

    /// Attach descriptive attributes to an identity.
    pub fn set_profile(&self, identity_id: &str, profile: Profile) -> Result<(), StoreError> {
        self.commit("set_profile", |state| {
            if !state.identities.contains_key(identity_id) {
                return Err(StoreError::NotFound(identity_id.to_string()));
            }
            state.profiles.insert(identity_id.to_string(), profile);
            Ok(())
        })
    }

    pub fn profile(&self, identity_id: &str) -> Option<Profile> {
        self.state.read().profiles.get(identity_id).cloned()
    }

    /// Snapshot of every identity, ordered by id.
    pub fn list_identities(&self) -> Vec<IdentitySummary> {
        self.state
            .read()
            .identities
            .values()
            .map(Identity::summary)
            .collect()
    }

    pub fn identity(&self, identity_id: &str) -> Option<IdentitySummary> {
        self.state
            .read()
            .identities
            .get(identity_id)
            .map(Identity::summary)
    }

    /// Per-template metadata (no feature numbers) in insertion order.
    pub fn templates(&self, identity_id: &str) -> Result<Vec<TemplateInfo>, StoreError> {
        let state = self.state.read();
        let identity = state
            .identities
            .get(identity_id)
            .ok_or_else(|| StoreError::NotFound(identity_id.to_string()))?;
        Ok(identity
            .templates
            .iter()
            .enumerate()
            .map(|(position, t)| TemplateInfo {
                position,
                quality_score: t.quality_score,
                provenance: t.provenance.clone(),
                created_at: t.created_at,
            })
            .collect())
    }

    /// Case-insensitive substring search over ids and display names.
    pub fn search(&self, query: &str) -> Vec<IdentitySummary> {
        let needle = query.to_lowercase();
        self.state
            .read()
            .identities
            .values()
            .filter(|i| {
                i.id.to_lowercase().contains(&needle)
                    || i.display_name.to_lowercase().contains(&needle)
            })
            .map(Identity::summary)
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        self.state.read().stats()
    }

    /// A copy of the full in-memory state.
    pub fn snapshot(&self) -> StoreState {
        self.state.read().clone()
    }

    /// Rank enrolled identities against `probe` (1:N identification).
    ///
    /// Identities without templates are never candidates. `top_k = 0` and
    /// an empty store both yield an empty list.
    pub fn match_probe(
        &self,
        probe: &FeatureVector,
        top_k: usize,
        report_threshold: f32,
    ) -> Result<Vec<MatchCandidate>, StoreError> {
        let state = self.state.read();
        let gallery: Vec<GalleryEntry<'_, Template>> = state
            .identities
            .values()
            .map(|i| GalleryEntry {
                identity_id: &i.id,
                templates: &i.templates,
            })
            .collect();
        let query = MatchQuery {
            top_k,
            report_threshold,
        };
        let candidates = self.matcher.rank(probe, &gallery, &query)?;
        tracing::debug!(
            gallery = gallery.len(),
            returned = candidates.len(),
            best = candidates.first().map(|c| c.confidence),
            "match query"
        );
        Ok(candidates)
    }

    /// Score `probe` against a single claimed identity (1:1 verification).
    pub fn verify(
        &self,
        identity_id: &str,
        probe: &FeatureVector,
    ) -> Result<MatchCandidate, StoreError> {
        let state = self.state.read();
        let identity = state
            .identities
            .get(identity_id)
            .ok_or_else(|| StoreError::NotFound(identity_id.to_string()))?;
        let entry = GalleryEntry {
            identity_id: &identity.id,
            templates: identity.templates.as_slice(),
        };
        self.matcher.score(probe, &entry)?.ok_or_else(|| {
            StoreError::validation(format!("identity {identity_id} has no templates"))
        })
    }
}
