//! The manifest store contract.

use std::fmt;

use bytes::Bytes;

use super::StoreError;
use crate::digest::Digest;
use crate::name::{Reference, RepositoryName};

/// A stored manifest.
///
/// The manifest bytes live in the blob store under `digest`. Index documents may
/// carry a cached copy in `raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Digest of the manifest bytes.
    pub digest: Digest,
    /// Media type the manifest was pushed with.
    pub content_type: String,
    /// Length of the manifest bytes.
    pub size: u64,
    /// Cached manifest bytes.
    pub raw: Option<Bytes>,
}

impl Manifest {
    /// Whether re-pushing `other` under the same reference is a no-op.
    pub fn same_content(&self, other: &Manifest) -> bool {
        self.digest == other.digest && self.content_type == other.content_type
    }
}

/// Decide whether writing `manifest` under `reference` is needed.
///
/// Returns `false` for an identical re-push, and a conflict when the reference
/// already holds different content.
pub(crate) fn check_reference(
    reference: &Reference,
    existing: Option<&Manifest>,
    manifest: &Manifest,
) -> Result<bool, StoreError> {
    match existing {
        None => Ok(true),
        Some(existing) if existing.same_content(manifest) => Ok(false),
        Some(existing) => Err(StoreError::TagConflict {
            reference: reference.to_string(),
            existing: format!("{} ({})", existing.digest, existing.content_type),
        }),
    }
}

/// Select tags after `last`, sorted, at most `limit` of them.
pub(crate) fn page_tags<'a, I>(tags: I, limit: Option<usize>, last: Option<&str>) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tags: Vec<&str> = tags
        .into_iter()
        .filter(|tag| last.is_none_or(|last| *tag > last))
        .collect();
    tags.sort_unstable();
    tags.into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(str::to_owned)
        .collect()
}

/// Reference to manifest mappings, per repository.
#[async_trait::async_trait]
pub trait ManifestStore: fmt::Debug + Send + Sync {
    /// Repository names, sorted, at most `limit` of them.
    async fn repositories(&self, limit: Option<usize>) -> Result<Vec<RepositoryName>, StoreError>;

    /// Tags in a repository, sorted, starting after `last`.
    async fn tags(
        &self,
        repository: &RepositoryName,
        limit: Option<usize>,
        last: Option<&str>,
    ) -> Result<Vec<String>, StoreError>;

    /// Digests of every manifest stored by digest reference.
    async fn digests(&self, repository: &RepositoryName) -> Result<Vec<Digest>, StoreError>;

    /// Look up a manifest by tag or digest.
    async fn get(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> Result<Manifest, StoreError>;

    /// Start a transaction for writing references.
    async fn begin(&self) -> Result<Box<dyn ManifestTransaction>, StoreError>;

    /// Write a single reference in its own transaction.
    async fn put(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
        manifest: &Manifest,
        blobs: &[Digest],
    ) -> Result<(), StoreError> {
        let mut transaction = self.begin().await?;
        transaction.put(repository, reference, manifest, blobs).await?;
        transaction.commit().await
    }

    /// Remove a reference.
    async fn delete(
        &self,
        _repository: &RepositoryName,
        _reference: &Reference,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("manifest deletion"))
    }
}

/// A group of reference writes which become visible together.
///
/// Dropping a transaction without calling [`commit`](ManifestTransaction::commit)
/// discards its writes.
#[async_trait::async_trait]
pub trait ManifestTransaction: Send {
    /// Point `reference` at `manifest`, which depends on `blobs`.
    async fn put(
        &mut self,
        repository: &RepositoryName,
        reference: &Reference,
        manifest: &Manifest,
        blobs: &[Digest],
    ) -> Result<(), StoreError>;

    /// Publish every write.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
