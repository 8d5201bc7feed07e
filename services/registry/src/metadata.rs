//! Artifact and version metadata.
//!
//! Each repository is an *artifact* owned by an organization. Every distinct
//! manifest pushed to it is a *version*, and tags and digests are *references*
//! pointing at versions. Writes happen in a [`MetadataTransaction`] so a manifest's
//! references become visible together.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::digest::Digest;
use crate::name::RepositoryName;

/// Errors from a metadata backend.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// A stored record failed validation.
    #[error("invalid metadata record: {0}")]
    Invalid(String),

    /// Records could not be encoded or decoded.
    #[error("metadata serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// The snapshot file could not be read or written.
    #[error("metadata snapshot {path}")]
    Snapshot {
        /// Snapshot file.
        path: Utf8PathBuf,
        /// Cause.
        #[source]
        error: io::Error,
    },
}

/// A repository, as an organization-owned artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Owning organization.
    pub organization: String,
    /// Artifact name.
    pub name: String,
    /// When the first manifest was pushed.
    pub created: DateTime<Utc>,
}

impl ArtifactRecord {
    /// The repository this artifact is stored under.
    pub fn repository(&self) -> Result<RepositoryName, MetadataError> {
        RepositoryName::new(&self.organization, &self.name)
            .map_err(|error| MetadataError::Invalid(error.to_string()))
    }
}

/// One pushed manifest of an artifact, keyed by its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Version key.
    pub version: String,
    /// Manifest digest.
    pub digest: Digest,
    /// Manifest media type.
    pub content_type: String,
    /// Manifest length in bytes.
    pub size: u64,
    /// Blobs and child manifests the manifest depends on.
    pub blobs: Vec<Digest>,
    /// Most recent push of this version.
    pub last_pushed: DateTime<Utc>,
}

/// A tag or digest string pointing at a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    /// Tag or digest string.
    pub reference: String,
    /// Version it points at.
    pub version: String,
}

/// Read access to metadata, and the entry point for transactions.
#[async_trait::async_trait]
pub trait MetadataStore: fmt::Debug + Send + Sync {
    /// Every artifact, ordered by repository name.
    async fn artifacts(&self) -> Result<Vec<ArtifactRecord>, MetadataError>;

    /// The artifact stored under `repository`.
    async fn artifact(
        &self,
        repository: &RepositoryName,
    ) -> Result<Option<ArtifactRecord>, MetadataError>;

    /// Every reference in a repository.
    async fn references(
        &self,
        repository: &RepositoryName,
    ) -> Result<Vec<ReferenceRecord>, MetadataError>;

    /// The version a reference points at.
    async fn resolve(
        &self,
        repository: &RepositoryName,
        reference: &str,
    ) -> Result<Option<VersionRecord>, MetadataError>;

    /// Start a transaction.
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, MetadataError>;
}

/// A unit of metadata writes.
///
/// Reads see the transaction's own writes. Dropping without
/// [`commit`](MetadataTransaction::commit) discards everything.
#[async_trait::async_trait]
pub trait MetadataTransaction: Send {
    /// Read or create the artifact for `repository`.
    async fn ensure_artifact(
        &mut self,
        repository: &RepositoryName,
    ) -> Result<ArtifactRecord, MetadataError>;

    /// The version a reference points at.
    async fn resolve(
        &mut self,
        repository: &RepositoryName,
        reference: &str,
    ) -> Result<Option<VersionRecord>, MetadataError>;

    /// Create or replace a version.
    async fn put_version(
        &mut self,
        repository: &RepositoryName,
        version: VersionRecord,
    ) -> Result<(), MetadataError>;

    /// Create or replace a reference.
    async fn put_reference(
        &mut self,
        repository: &RepositoryName,
        reference: ReferenceRecord,
    ) -> Result<(), MetadataError>;

    /// Publish all writes.
    async fn commit(self: Box<Self>) -> Result<(), MetadataError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactEntry {
    artifact: ArtifactRecord,
    #[serde(default)]
    versions: BTreeMap<String, VersionRecord>,
    #[serde(default)]
    references: BTreeMap<String, ReferenceRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    artifacts: BTreeMap<String, ArtifactEntry>,
}

impl Snapshot {
    fn entry(&self, repository: &RepositoryName) -> Option<&ArtifactEntry> {
        self.artifacts.get(&repository.to_string())
    }

    fn entry_mut(&mut self, repository: &RepositoryName) -> Result<&mut ArtifactEntry, MetadataError> {
        self.artifacts
            .get_mut(&repository.to_string())
            .ok_or_else(|| MetadataError::Invalid(format!("no artifact for {repository}")))
    }

    fn resolve(&self, repository: &RepositoryName, reference: &str) -> Option<VersionRecord> {
        let entry = self.entry(repository)?;
        let link = entry.references.get(reference)?;
        entry.versions.get(&link.version).cloned()
    }
}

/// Write a snapshot next to `path`, then move it into place.
async fn write_snapshot(path: Utf8PathBuf, snapshot: &Snapshot) -> Result<(), MetadataError> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let target = path.clone();
    let written = tokio::task::spawn_blocking(move || -> io::Result<()> {
        let dir = match target.parent() {
            Some(dir) if !dir.as_str().is_empty() => dir,
            _ => Utf8Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&json)?;
        file.as_file().sync_all()?;
        file.persist(&target).map_err(|error| error.error)?;
        Ok(())
    })
    .await
    .map_err(io::Error::other)
    .and_then(|result| result);

    written.map_err(|error| MetadataError::Snapshot { path, error })
}

/// Metadata kept in process memory.
///
/// Transactions serialize on a single lock and work on a private copy which
/// replaces the shared state on commit. A persistent store also rewrites its
/// snapshot file on every commit, before the new state is published.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadata {
    state: Arc<AsyncMutex<Snapshot>>,
    persist: Option<Utf8PathBuf>,
}

impl MemoryMetadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore metadata from [`to_json`](Self::to_json) output.
    pub fn from_json(json: &str) -> Result<Self, MetadataError> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        Ok(Self {
            state: Arc::new(AsyncMutex::new(snapshot)),
            persist: None,
        })
    }

    /// Metadata saved to the JSON snapshot at `path`, starting from it if it exists.
    #[tracing::instrument(skip_all, fields(%path))]
    pub async fn persistent(path: Utf8PathBuf) -> Result<Self, MetadataError> {
        let snapshot = match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json)?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no snapshot yet, starting empty");
                Snapshot::default()
            }
            Err(error) => return Err(MetadataError::Snapshot { path, error }),
        };
        Ok(Self {
            state: Arc::new(AsyncMutex::new(snapshot)),
            persist: Some(path),
        })
    }

    /// Serialize all committed metadata.
    pub async fn to_json(&self) -> Result<String, MetadataError> {
        let state = self.state.lock().await;
        Ok(serde_json::to_string(&*state)?)
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryMetadata {
    async fn artifacts(&self) -> Result<Vec<ArtifactRecord>, MetadataError> {
        let state = self.state.lock().await;
        Ok(state
            .artifacts
            .values()
            .map(|entry| entry.artifact.clone())
            .collect())
    }

    async fn artifact(
        &self,
        repository: &RepositoryName,
    ) -> Result<Option<ArtifactRecord>, MetadataError> {
        let state = self.state.lock().await;
        Ok(state.entry(repository).map(|entry| entry.artifact.clone()))
    }

    async fn references(
        &self,
        repository: &RepositoryName,
    ) -> Result<Vec<ReferenceRecord>, MetadataError> {
        let state = self.state.lock().await;
        Ok(state
            .entry(repository)
            .map(|entry| entry.references.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn resolve(
        &self,
        repository: &RepositoryName,
        reference: &str,
    ) -> Result<Option<VersionRecord>, MetadataError> {
        let state = self.state.lock().await;
        Ok(state.resolve(repository, reference))
    }

    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, MetadataError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryMetadataTransaction {
            guard,
            working,
            persist: self.persist.clone(),
        }))
    }
}

#[derive(Debug)]
struct MemoryMetadataTransaction {
    guard: OwnedMutexGuard<Snapshot>,
    working: Snapshot,
    persist: Option<Utf8PathBuf>,
}

#[async_trait::async_trait]
impl MetadataTransaction for MemoryMetadataTransaction {
    async fn ensure_artifact(
        &mut self,
        repository: &RepositoryName,
    ) -> Result<ArtifactRecord, MetadataError> {
        let entry = self
            .working
            .artifacts
            .entry(repository.to_string())
            .or_insert_with(|| ArtifactEntry {
                artifact: ArtifactRecord {
                    organization: repository.organization().to_string(),
                    name: repository.artifact().to_string(),
                    created: Utc::now(),
                },
                versions: BTreeMap::new(),
                references: BTreeMap::new(),
            });
        Ok(entry.artifact.clone())
    }

    async fn resolve(
        &mut self,
        repository: &RepositoryName,
        reference: &str,
    ) -> Result<Option<VersionRecord>, MetadataError> {
        Ok(self.working.resolve(repository, reference))
    }

    async fn put_version(
        &mut self,
        repository: &RepositoryName,
        version: VersionRecord,
    ) -> Result<(), MetadataError> {
        let entry = self.working.entry_mut(repository)?;
        entry.versions.insert(version.version.clone(), version);
        Ok(())
    }

    async fn put_reference(
        &mut self,
        repository: &RepositoryName,
        reference: ReferenceRecord,
    ) -> Result<(), MetadataError> {
        let entry = self.working.entry_mut(repository)?;
        if !entry.versions.contains_key(&reference.version) {
            return Err(MetadataError::Invalid(format!(
                "reference {} points at unknown version {}",
                reference.reference, reference.version
            )));
        }
        entry.references.insert(reference.reference.clone(), reference);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), MetadataError> {
        let MemoryMetadataTransaction {
            mut guard,
            working,
            persist,
        } = *self;
        if let Some(path) = persist {
            write_snapshot(path, &working).await?;
        }
        *guard = working;
        Ok(())
    }
}
