//! facemesh-store: Durable per-identity template store.
//!
//! Holds enrolled identities and their feature templates behind a
//! readers-writer lock, persists every mutation as a metadata/template
//! artifact pair before reporting success, and answers 1:N match and
//! 1:1 verify queries through the facemesh-core matcher.

pub mod backend;
pub mod codec;
pub mod error;
pub mod model;
pub mod store;

pub use backend::{ArtifactBackend, CommittedPair, FsBackend, MemoryBackend};
pub use error::StoreError;
pub use model::{
    EnrollMode, Identity, IdentitySummary, NewTemplate, Profile, StoreState, StoreStats,
    Template, TemplateInfo,
};
pub use store::{StoreOptions, TemplateStore};
