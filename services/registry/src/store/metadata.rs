//! Manifest store recorded in artifact metadata.

use std::sync::Arc;

use chrono::Utc;

use super::manifests::{Manifest, ManifestStore, ManifestTransaction, check_reference, page_tags};
use super::StoreError;
use crate::digest::Digest;
use crate::metadata::{MetadataStore, MetadataTransaction, ReferenceRecord, VersionRecord};
use crate::name::{Reference, RepositoryName};

/// Manifest references kept as artifact, version and reference records.
///
/// Each push records the manifest as a version of the repository's artifact,
/// together with the blobs it depends on and when it was last pushed.
#[derive(Debug, Clone)]
pub struct MetadataManifestStore {
    metadata: Arc<dyn MetadataStore>,
}

impl MetadataManifestStore {
    /// Store manifests in `metadata`.
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    async fn require_artifact(&self, repository: &RepositoryName) -> Result<(), StoreError> {
        match self.metadata.artifact(repository).await? {
            Some(_) => Ok(()),
            None => Err(StoreError::NameUnknown(repository.clone())),
        }
    }
}

fn to_manifest(version: VersionRecord) -> Manifest {
    Manifest {
        digest: version.digest,
        content_type: version.content_type,
        size: version.size,
        raw: None,
    }
}

#[async_trait::async_trait]
impl ManifestStore for MetadataManifestStore {
    async fn repositories(&self, limit: Option<usize>) -> Result<Vec<RepositoryName>, StoreError> {
        let artifacts = self.metadata.artifacts().await?;
        Ok(artifacts
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|artifact| artifact.repository())
            .collect::<Result<_, _>>()?)
    }

    async fn tags(
        &self,
        repository: &RepositoryName,
        limit: Option<usize>,
        last: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        self.require_artifact(repository).await?;
        let references = self.metadata.references(repository).await?;
        Ok(page_tags(
            references
                .iter()
                .map(|record| record.reference.as_str())
                .filter(|reference| !reference.contains(':')),
            limit,
            last,
        ))
    }

    async fn digests(&self, repository: &RepositoryName) -> Result<Vec<Digest>, StoreError> {
        self.require_artifact(repository).await?;
        let references = self.metadata.references(repository).await?;
        Ok(references
            .iter()
            .filter_map(|record| record.reference.parse().ok())
            .collect())
    }

    async fn get(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> Result<Manifest, StoreError> {
        self.require_artifact(repository).await?;
        self.metadata
            .resolve(repository, &reference.to_string())
            .await?
            .map(to_manifest)
            .ok_or_else(|| StoreError::ManifestUnknown {
                repository: repository.clone(),
                reference: reference.clone(),
            })
    }

    async fn begin(&self) -> Result<Box<dyn ManifestTransaction>, StoreError> {
        let transaction = self.metadata.begin().await?;
        Ok(Box::new(MetadataManifestTransaction { transaction }))
    }
}

struct MetadataManifestTransaction {
    transaction: Box<dyn MetadataTransaction>,
}

#[async_trait::async_trait]
impl ManifestTransaction for MetadataManifestTransaction {
    #[tracing::instrument(skip(self, manifest, blobs), fields(%repository, %reference, digest = %manifest.digest))]
    async fn put(
        &mut self,
        repository: &RepositoryName,
        reference: &Reference,
        manifest: &Manifest,
        blobs: &[Digest],
    ) -> Result<(), StoreError> {
        self.transaction.ensure_artifact(repository).await?;

        let key = reference.to_string();
        let existing = self
            .transaction
            .resolve(repository, &key)
            .await?
            .map(to_manifest);
        let write = check_reference(reference, existing.as_ref(), manifest)?;

        // Re-pushes still refresh the version's push time.
        let version = manifest.digest.to_string();
        self.transaction
            .put_version(
                repository,
                VersionRecord {
                    version: version.clone(),
                    digest: manifest.digest.clone(),
                    content_type: manifest.content_type.clone(),
                    size: manifest.size,
                    blobs: blobs.to_vec(),
                    last_pushed: Utc::now(),
                },
            )
            .await?;

        if write {
            self.transaction
                .put_reference(
                    repository,
                    ReferenceRecord {
                        reference: key,
                        version,
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.transaction.commit().await?;
        Ok(())
    }
}
