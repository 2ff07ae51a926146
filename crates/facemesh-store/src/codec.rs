//! Persistence codec: JSON metadata artifact plus postcard template blob.
//!
//! The metadata artifact is human-readable and carries everything except
//! the feature numbers. The template artifact is a compact binary sequence
//! of vectors keyed by (identity id, position), aligned 1:1 with the
//! metadata template lists. The metadata records the blob's file name and
//! SHA-256 so a mismatched pair is detected on load.

use crate::error::StoreError;
use crate::model::{Identity, Profile, StoreState, Template};
use chrono::{DateTime, Utc};
use facemesh_core::FeatureVector;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const FORMAT_VERSION: u32 = 1;
pub const METADATA_FILE: &str = "metadata.json";
const BLOB_PREFIX: &str = "templates-";
const BLOB_SUFFIX: &str = ".bin";

/// Serialized pair ready to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub metadata: Vec<u8>,
    pub templates: Vec<u8>,
    /// File name the template artifact is stored under.
    pub blob_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataDoc {
    format_version: u32,
    dimension: usize,
    generation: u64,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    template_blob: BlobRef,
    identities: Vec<IdentityMeta>,
    #[serde(default)]
    profiles: BTreeMap<String, Profile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobRef {
    file: String,
    sha256: String,
    records: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityMeta {
    id: String,
    display_name: String,
    consent_granted: bool,
    created_at: DateTime<Utc>,
    templates: Vec<TemplateMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TemplateMeta {
    provenance: String,
    quality_score: f32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TemplateBlob {
    dimension: u32,
    records: Vec<TemplateRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TemplateRecord {
    identity_id: String,
    position: u32,
    values: Vec<f32>,
}

/// Only the blob reference of a metadata artifact, for backends that need
/// to locate the template artifact before full decoding.
#[derive(Debug, Deserialize)]
struct MetadataHead {
    template_blob: BlobRef,
}

/// File name of the template artifact for a given generation.
pub fn blob_file_name(generation: u64) -> String {
    format!("{BLOB_PREFIX}{generation:016x}{BLOB_SUFFIX}")
}

pub fn is_blob_file_name(name: &str) -> bool {
    name.len() == BLOB_PREFIX.len() + 16 + BLOB_SUFFIX.len()
        && name.starts_with(BLOB_PREFIX)
        && name.ends_with(BLOB_SUFFIX)
        && name[BLOB_PREFIX.len()..BLOB_PREFIX.len() + 16]
            .chars()
            .all(|c| c.is_ascii_hexdigit())
}

/// Read the template artifact's file name out of a metadata artifact.
pub fn blob_reference(metadata: &[u8]) -> Result<String, StoreError> {
    let head: MetadataHead = serde_json::from_slice(metadata)
        .map_err(|e| StoreError::corrupt(format!("unreadable metadata artifact: {e}")))?;
    if !is_blob_file_name(&head.template_blob.file) {
        return Err(StoreError::corrupt(format!(
            "metadata references invalid template artifact name {:?}",
            head.template_blob.file
        )));
    }
    Ok(head.template_blob.file)
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Encode a store into its metadata and template artifacts.
pub fn serialize(state: &StoreState) -> Result<Artifacts, StoreError> {
    let dimension = u32::try_from(state.dimension)
        .map_err(|_| StoreError::validation("dimension does not fit the template artifact"))?;

    let mut records = Vec::with_capacity(state.total_templates());
    let mut identities = Vec::with_capacity(state.identities.len());

    for identity in state.identities.values() {
        let mut templates = Vec::with_capacity(identity.templates.len());
        for (position, template) in identity.templates.iter().enumerate() {
            records.push(TemplateRecord {
                identity_id: identity.id.clone(),
                position: position as u32,
                values: template.vector.values().to_vec(),
            });
            templates.push(TemplateMeta {
                provenance: template.provenance.clone(),
                quality_score: template.quality_score,
                created_at: template.created_at,
            });
        }
        identities.push(IdentityMeta {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            consent_granted: identity.consent_granted,
            created_at: identity.created_at,
            templates,
        });
    }

    let record_count = records.len();
    let templates = postcard::to_allocvec(&TemplateBlob { dimension, records })
        .map_err(|e| StoreError::validation(format!("encoding template artifact: {e}")))?;

    let blob_name = blob_file_name(state.generation);
    let doc = MetadataDoc {
        format_version: FORMAT_VERSION,
        dimension: state.dimension,
        generation: state.generation,
        created_at: state.created_at,
        last_modified: state.last_modified,
        template_blob: BlobRef {
            file: blob_name.clone(),
            sha256: sha256_hex(&templates),
            records: record_count,
        },
        identities,
        profiles: state.profiles.clone(),
    };
    let metadata = serde_json::to_vec_pretty(&doc)
        .map_err(|e| StoreError::validation(format!("encoding metadata artifact: {e}")))?;

    Ok(Artifacts {
        metadata,
        templates,
        blob_name,
    })
}

/// Decode and structurally validate an artifact pair.
///
/// Any inconsistency between the two artifacts is a `CorruptStore` error;
/// nothing is dropped or repaired.
pub fn deserialize(metadata: &[u8], templates: &[u8]) -> Result<StoreState, StoreError> {
    let doc: MetadataDoc = serde_json::from_slice(metadata)
        .map_err(|e| StoreError::corrupt(format!("unreadable metadata artifact: {e}")))?;

    if doc.format_version != FORMAT_VERSION {
        return Err(StoreError::corrupt(format!(
            "unsupported format version {} (expected {FORMAT_VERSION})",
            doc.format_version
        )));
    }
    if doc.dimension == 0 {
        return Err(StoreError::corrupt("dimension is zero"));
    }
    if doc.template_blob.file != blob_file_name(doc.generation) {
        return Err(StoreError::corrupt(format!(
            "template artifact {} does not belong to generation {}",
            doc.template_blob.file, doc.generation
        )));
    }
    let digest = sha256_hex(templates);
    if digest != doc.template_blob.sha256 {
        return Err(StoreError::corrupt(format!(
            "template artifact checksum mismatch: metadata says {}, found {digest}",
            doc.template_blob.sha256
        )));
    }

    let blob: TemplateBlob = postcard::from_bytes(templates)
        .map_err(|e| StoreError::corrupt(format!("unreadable template artifact: {e}")))?;

    if blob.dimension as usize != doc.dimension {
        return Err(StoreError::corrupt(format!(
            "dimension mismatch: metadata {}, template artifact {}",
            doc.dimension, blob.dimension
        )));
    }
    let expected_records: usize = doc.identities.iter().map(|i| i.templates.len()).sum();
    if blob.records.len() != expected_records || doc.template_blob.records != expected_records {
        return Err(StoreError::corrupt(format!(
            "template count mismatch: metadata lists {expected_records}, artifact holds {}",
            blob.records.len()
        )));
    }

    let mut records = blob.records.into_iter();
    let mut identities = BTreeMap::new();

    for meta in doc.identities {
        if meta.id.is_empty() {
            return Err(StoreError::corrupt("identity with empty id"));
        }
        let mut templates = Vec::with_capacity(meta.templates.len());
        for (position, tmeta) in meta.templates.into_iter().enumerate() {
            let record = records
                .next()
                .ok_or_else(|| StoreError::corrupt("template artifact ended early"))?;
            if record.identity_id != meta.id || record.position as usize != position {
                return Err(StoreError::corrupt(format!(
                    "template misaligned: expected ({}, {position}), found ({}, {})",
                    meta.id, record.identity_id, record.position
                )));
            }
            if record.values.len() != doc.dimension {
                return Err(StoreError::corrupt(format!(
                    "template ({}, {position}) has {} values, expected {}",
                    meta.id,
                    record.values.len(),
                    doc.dimension
                )));
            }
            if !(0.0..=1.0).contains(&tmeta.quality_score) {
                return Err(StoreError::corrupt(format!(
                    "template ({}, {position}) has quality score {} outside [0, 1]",
                    meta.id, tmeta.quality_score
                )));
            }
            let vector = FeatureVector::new(record.values).map_err(|e| {
                StoreError::corrupt(format!("template ({}, {position}): {e}", meta.id))
            })?;
            templates.push(Template {
                vector,
                quality_score: tmeta.quality_score,
                provenance: tmeta.provenance,
                created_at: tmeta.created_at,
            });
        }

        let identity = Identity {
            id: meta.id.clone(),
            display_name: meta.display_name,
            consent_granted: meta.consent_granted,
            created_at: meta.created_at,
            templates,
        };
        if identities.insert(meta.id.clone(), identity).is_some() {
            return Err(StoreError::corrupt(format!("duplicate identity {}", meta.id)));
        }
    }

    if let Some(orphan) = doc.profiles.keys().find(|id| !identities.contains_key(*id)) {
        return Err(StoreError::corrupt(format!(
            "profile for unknown identity {orphan}"
        )));
    }

    Ok(StoreState {
        dimension: doc.dimension,
        generation: doc.generation,
        created_at: doc.created_at,
        last_modified: doc.last_modified,
        identities,
        profiles: doc.profiles,
    })
}
