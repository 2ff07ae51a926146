//! Durable homes for the artifact pair.
//!
//! A backend either commits a whole pair or leaves the previously
//! committed pair untouched.

use crate::codec::{self, Artifacts, METADATA_FILE};
use crate::error::StoreError;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// The committed metadata and template artifacts, as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedPair {
    pub metadata: Vec<u8>,
    pub templates: Vec<u8>,
}

/// Storage for the committed artifact pair.
///
/// Implementations must be safe for concurrent use.
pub trait ArtifactBackend: Send + Sync {
    /// The committed pair, or `None` if nothing has ever been committed.
    fn read(&self) -> Result<Option<CommittedPair>, StoreError>;

    /// Replace the committed pair with `artifacts`, all or nothing.
    fn commit(&self, artifacts: &Artifacts) -> Result<(), StoreError>;
}

/// Directory-backed artifacts.
///
/// Layout: `metadata.json` plus one `templates-<generation>.bin`. The blob
/// is written under a fresh name first; the atomic rename of the metadata
/// file is the single commit point for the pair.
#[derive(Debug)]
pub struct FsBackend {
    dir: PathBuf,
}

impl FsBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Post-commit housekeeping. The pair is already committed, so failures
    /// are logged and never reported to the caller.
    fn finish_commit(&self, blob_name: &str) {
        if let Err(e) = sync_dir(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "failed to sync store directory");
        }
        self.sweep(Some(blob_name));
    }

    /// Name of the blob the committed metadata points at, if readable.
    fn committed_blob(&self) -> Option<String> {
        let metadata = fs::read(self.metadata_path()).ok()?;
        codec::blob_reference(&metadata).ok()
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!(".{name}.tmp-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Remove temp files, and template blobs other than `keep` when given.
    fn sweep(&self, keep: Option<&str>) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "cannot scan store directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let stale = is_tmp_file_name(name)
                || keep.is_some_and(|keep| codec::is_blob_file_name(name) && name != keep);
            if stale {
                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::warn!(file = name, error = %e, "failed to remove stale artifact");
                } else {
                    tracing::debug!(file = name, "removed stale artifact");
                }
            }
        }
    }
}

fn is_tmp_file_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp-")
}

/// Template blobs present in `dir`, sorted by name.
fn blob_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut blobs: Vec<String> = fs::read_dir(dir)?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| codec::is_blob_file_name(name))
        .collect();
    blobs.sort();
    Ok(blobs)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl ArtifactBackend for FsBackend {
    fn read(&self) -> Result<Option<CommittedPair>, StoreError> {
        let metadata_path = self.metadata_path();
        let metadata = match fs::read(&metadata_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !self.dir.exists() {
                    return Ok(None);
                }
                let blobs = blob_files(&self.dir)
                    .map_err(|e| StoreError::io(format!("scanning {}", self.dir.display()), e))?;
                if let Some(orphan) = blobs.last() {
                    tracing::warn!(
                        dir = %self.dir.display(),
                        blob = %orphan,
                        "template artifact present without metadata"
                    );
                    return Err(StoreError::corrupt(format!(
                        "metadata artifact is missing but template artifact {orphan} exists"
                    )));
                }
                self.sweep(None);
                return Ok(None);
            }
            Err(e) => {
                return Err(StoreError::io(
                    format!("reading {}", metadata_path.display()),
                    e,
                ))
            }
        };

        let blob_name = codec::blob_reference(&metadata)?;
        let blob_path = self.dir.join(&blob_name);
        let templates = match fs::read(&blob_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::corrupt(format!(
                    "template artifact {blob_name} is missing"
                )))
            }
            Err(e) => {
                return Err(StoreError::io(
                    format!("reading {}", blob_path.display()),
                    e,
                ))
            }
        };

        Ok(Some(CommittedPair {
            metadata,
            templates,
        }))
    }

    fn commit(&self, artifacts: &Artifacts) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError::io(format!("creating {}", self.dir.display()), e))?;

        let blob_path = self.dir.join(&artifacts.blob_name);
        if blob_path.exists() {
            if self.committed_blob().as_deref() == Some(artifacts.blob_name.as_str()) {
                return Err(StoreError::io(
                    "installing template artifact",
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} belongs to the committed pair", artifacts.blob_name),
                    ),
                ));
            }
            // Left behind by an interrupted commit.
            fs::remove_file(&blob_path)
                .map_err(|e| StoreError::io("removing uncommitted template artifact", e))?;
        }
        let blob_tmp = self.tmp_path(&artifacts.blob_name);
        let meta_tmp = self.tmp_path(METADATA_FILE);
        let mut blob_installed = false;

        let staged = (|| -> Result<(), StoreError> {
            write_synced(&blob_tmp, &artifacts.templates)
                .map_err(|e| StoreError::io("writing template artifact", e))?;
            fs::rename(&blob_tmp, &blob_path)
                .map_err(|e| StoreError::io("installing template artifact", e))?;
            blob_installed = true;
            write_synced(&meta_tmp, &artifacts.metadata)
                .map_err(|e| StoreError::io("writing metadata artifact", e))?;
            fs::rename(&meta_tmp, self.metadata_path())
                .map_err(|e| StoreError::io("committing metadata artifact", e))
        })();

        if let Err(err) = staged {
            let _ = fs::remove_file(&blob_tmp);
            let _ = fs::remove_file(&meta_tmp);
            if blob_installed {
                let _ = fs::remove_file(&blob_path);
            }
            return Err(err);
        }

        // Committed from here on; later failures only cost durability of the rename.
        self.finish_commit(&artifacts.blob_name);

        tracing::debug!(
            dir = %self.dir.display(),
            blob = %artifacts.blob_name,
            metadata_bytes = artifacts.metadata.len(),
            template_bytes = artifacts.templates.len(),
            "artifacts committed"
        );
        Ok(())
    }
}

/// In-memory artifacts. Data is lost on restart; for tests and ephemeral use.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    committed: Mutex<Option<CommittedPair>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend with an existing pair.
    pub fn with_pair(pair: CommittedPair) -> Self {
        Self {
            committed: Mutex::new(Some(pair)),
        }
    }
}

impl ArtifactBackend for MemoryBackend {
    fn read(&self) -> Result<Option<CommittedPair>, StoreError> {
        Ok(self.committed.lock().clone())
    }

    fn commit(&self, artifacts: &Artifacts) -> Result<(), StoreError> {
        *self.committed.lock() = Some(CommittedPair {
            metadata: artifacts.metadata.clone(),
            templates: artifacts.templates.clone(),
        });
        Ok(())
    }
}
