//! In-process blob and manifest stores.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::blobs::{
    BlobDelete, BlobRead, BlobReader, BlobStat, BlobUploads, BlobWrite, BodyReader, Located,
};
use super::manifests::{Manifest, ManifestStore, ManifestTransaction, check_reference, page_tags};
use super::StoreError;
use crate::digest::Digest;
use crate::name::{Reference, RepositoryName, SessionId};

#[derive(Debug)]
struct UploadSession {
    repository: RepositoryName,
    data: Vec<u8>,
}

/// Blobs and upload sessions held in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<Digest, Bytes>>,
    sessions: Mutex<HashMap<SessionId, UploadSession>>,
}

impl MemoryBlobStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether no blobs are stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    fn session_size(&self, repository: &RepositoryName, session: SessionId) -> Result<u64, StoreError> {
        let sessions = self.sessions.lock();
        match sessions.get(&session) {
            Some(upload) if &upload.repository == repository => Ok(upload.data.len() as u64),
            _ => Err(StoreError::UploadUnknown(session)),
        }
    }
}

async fn read_body(reader: &mut BodyReader<'_>) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[async_trait::async_trait]
impl BlobRead for MemoryBlobStore {
    async fn get(
        &self,
        _repository: &RepositoryName,
        digest: &Digest,
        _allow_redirect: bool,
    ) -> Result<Located<BlobReader>, StoreError> {
        let data = self
            .blobs
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(digest.clone()))?;
        Ok(Located::Here(BlobReader {
            size: Some(data.len() as u64),
            reader: Box::new(Cursor::new(data)),
        }))
    }
}

#[async_trait::async_trait]
impl BlobStat for MemoryBlobStore {
    async fn stat(
        &self,
        _repository: &RepositoryName,
        digest: &Digest,
    ) -> Result<Located<u64>, StoreError> {
        self.blobs
            .read()
            .get(digest)
            .map(|data| Located::Here(data.len() as u64))
            .ok_or_else(|| StoreError::NotFound(digest.clone()))
    }
}

#[async_trait::async_trait]
impl BlobWrite for MemoryBlobStore {
    #[tracing::instrument(skip(self, reader), fields(%repository, %digest))]
    async fn put(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        _content_type: Option<&str>,
        reader: &mut BodyReader<'_>,
    ) -> Result<(), StoreError> {
        let data = read_body(reader).await?;
        self.blobs
            .write()
            .entry(digest.clone())
            .or_insert_with(|| data.into());
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobUploads for MemoryBlobStore {
    async fn start_session(&self, repository: &RepositoryName) -> Result<SessionId, StoreError> {
        let session = SessionId::generate();
        self.sessions.lock().insert(
            session,
            UploadSession {
                repository: repository.clone(),
                data: Vec::new(),
            },
        );
        tracing::debug!(%repository, %session, "started upload session");
        Ok(session)
    }

    #[tracing::instrument(skip(self, reader), fields(%repository, %session))]
    async fn put_chunk(
        &self,
        repository: &RepositoryName,
        session: SessionId,
        reader: &mut BodyReader<'_>,
        offset: u64,
    ) -> Result<u64, StoreError> {
        let current = self.session_size(repository, session)?;
        if offset != current {
            return Err(StoreError::BadUpload {
                expected: current,
                offset,
            });
        }

        let chunk = read_body(reader).await?;

        // Another writer may have appended while the chunk was being read.
        let mut sessions = self.sessions.lock();
        let upload = sessions
            .get_mut(&session)
            .filter(|upload| &upload.repository == repository)
            .ok_or(StoreError::UploadUnknown(session))?;
        let committed = upload.data.len() as u64;
        if committed != offset {
            return Err(StoreError::BadUpload {
                expected: committed,
                offset,
            });
        }
        upload.data.extend_from_slice(&chunk);
        Ok(upload.data.len() as u64)
    }

    async fn uploaded_size(
        &self,
        repository: &RepositoryName,
        session: SessionId,
    ) -> Result<u64, StoreError> {
        self.session_size(repository, session)
    }

    #[tracing::instrument(skip(self), fields(%repository, %session, %digest))]
    async fn complete(
        &self,
        repository: &RepositoryName,
        session: SessionId,
        digest: &Digest,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        let upload = sessions
            .get(&session)
            .filter(|upload| &upload.repository == repository)
            .ok_or(StoreError::UploadUnknown(session))?;

        let computed = Digest::compute(digest.algorithm(), &upload.data);
        if &computed != digest {
            return Err(StoreError::DigestMismatch {
                expected: digest.clone(),
                computed,
                read: upload.data.len() as u64,
            });
        }

        if let Some(upload) = sessions.remove(&session) {
            self.blobs
                .write()
                .entry(digest.clone())
                .or_insert_with(|| upload.data.into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobDelete for MemoryBlobStore {
    async fn delete(&self, _repository: &RepositoryName, _digest: &Digest) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("blob deletion"))
    }
}

type References = BTreeMap<RepositoryName, BTreeMap<Reference, Manifest>>;

/// Manifest references held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryManifestStore {
    references: Arc<AsyncMutex<References>>,
}

impl MemoryManifestStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn repositories(&self, limit: Option<usize>) -> Result<Vec<RepositoryName>, StoreError> {
        let references = self.references.lock().await;
        Ok(references
            .keys()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn tags(
        &self,
        repository: &RepositoryName,
        limit: Option<usize>,
        last: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let references = self.references.lock().await;
        let repo = references
            .get(repository)
            .ok_or_else(|| StoreError::NameUnknown(repository.clone()))?;
        Ok(page_tags(
            repo.keys().filter_map(Reference::as_tag),
            limit,
            last,
        ))
    }

    async fn digests(&self, repository: &RepositoryName) -> Result<Vec<Digest>, StoreError> {
        let references = self.references.lock().await;
        let repo = references
            .get(repository)
            .ok_or_else(|| StoreError::NameUnknown(repository.clone()))?;
        Ok(repo
            .keys()
            .filter_map(Reference::as_digest)
            .cloned()
            .collect())
    }

    async fn get(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> Result<Manifest, StoreError> {
        let references = self.references.lock().await;
        let repo = references
            .get(repository)
            .ok_or_else(|| StoreError::NameUnknown(repository.clone()))?;
        repo.get(reference)
            .cloned()
            .ok_or_else(|| StoreError::ManifestUnknown {
                repository: repository.clone(),
                reference: reference.clone(),
            })
    }

    async fn begin(&self) -> Result<Box<dyn ManifestTransaction>, StoreError> {
        let guard = self.references.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            staged: Vec::new(),
        }))
    }
}

/// Holds the store lock; writes are staged until commit.
#[derive(Debug)]
struct MemoryTransaction {
    guard: OwnedMutexGuard<References>,
    staged: Vec<(RepositoryName, Reference, Manifest)>,
}

impl MemoryTransaction {
    fn lookup(&self, repository: &RepositoryName, reference: &Reference) -> Option<&Manifest> {
        self.staged
            .iter()
            .rev()
            .find(|(repo, r, _)| repo == repository && r == reference)
            .map(|(_, _, manifest)| manifest)
            .or_else(|| self.guard.get(repository)?.get(reference))
    }
}

#[async_trait::async_trait]
impl ManifestTransaction for MemoryTransaction {
    async fn put(
        &mut self,
        repository: &RepositoryName,
        reference: &Reference,
        manifest: &Manifest,
        _blobs: &[Digest],
    ) -> Result<(), StoreError> {
        if check_reference(reference, self.lookup(repository, reference), manifest)? {
            self.staged
                .push((repository.clone(), reference.clone(), manifest.clone()));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { mut guard, staged } = *self;
        for (repository, reference, manifest) in staged {
            tracing::debug!(%repository, %reference, digest = %manifest.digest, "stored manifest reference");
            guard
                .entry(repository)
                .or_default()
                .insert(reference, manifest);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepositoryName {
        "acme/app".parse().unwrap()
    }

    fn manifest(content: &[u8]) -> Manifest {
        Manifest {
            digest: Digest::sha256(content),
            content_type: "application/vnd.oci.image.manifest.v1+json".into(),
            size: content.len() as u64,
            raw: None,
        }
    }

    async fn read(store: &MemoryBlobStore, digest: &Digest) -> Vec<u8> {
        match store.get(&repo(), digest, true).await.unwrap() {
            Located::Here(mut blob) => {
                let mut buf = Vec::new();
                blob.reader.read_to_end(&mut buf).await.unwrap();
                buf
            }
            Located::Redirect(_) => panic!("memory store never redirects"),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryBlobStore::new();
        let digest = Digest::sha256(b"content");

        let mut body: &[u8] = b"content";
        store.put(&repo(), &digest, None, &mut body).await.unwrap();
        let mut body: &[u8] = b"content";
        store.put(&repo(), &digest, None, &mut body).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(read(&store, &digest).await, b"content");
        assert!(matches!(
            store.get(&repo(), &Digest::sha256(b"missing"), false).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn chunks_must_be_contiguous() {
        let store = MemoryBlobStore::new();
        let session = store.start_session(&repo()).await.unwrap();

        let mut chunk: &[u8] = b"AAAA";
        assert_eq!(store.put_chunk(&repo(), session, &mut chunk, 0).await.unwrap(), 4);

        let mut chunk: &[u8] = b"BBBB";
        let err = store.put_chunk(&repo(), session, &mut chunk, 2).await.unwrap_err();
        assert!(matches!(err, StoreError::BadUpload { expected: 4, offset: 2 }));
        assert_eq!(store.uploaded_size(&repo(), session).await.unwrap(), 4);

        let mut chunk: &[u8] = b"BBBB";
        assert_eq!(store.put_chunk(&repo(), session, &mut chunk, 4).await.unwrap(), 8);
        assert_eq!(store.uploaded_size(&repo(), session).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn concurrent_chunks_at_one_offset_are_serialized() {
        let store = MemoryBlobStore::new();
        let repo = repo();
        let session = store.start_session(&repo).await.unwrap();

        let (mut a, mut b): (&[u8], &[u8]) = (b"AAAA", b"BBBB");
        let (first, second) = tokio::join!(
            store.put_chunk(&repo, session, &mut a, 0),
            store.put_chunk(&repo, session, &mut b, 0),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| matches!(r, Ok(4))).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(StoreError::BadUpload { expected: 4, offset: 0 })))
                .count(),
            1
        );
        assert_eq!(store.uploaded_size(&repo, session).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn sessions_belong_to_one_repository() {
        let store = MemoryBlobStore::new();
        let session = store.start_session(&repo()).await.unwrap();
        let other: RepositoryName = "acme/other".parse().unwrap();

        assert!(matches!(
            store.uploaded_size(&other, session).await,
            Err(StoreError::UploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn complete_verifies_digest() {
        let store = MemoryBlobStore::new();
        let session = store.start_session(&repo()).await.unwrap();
        let mut chunk: &[u8] = b"AAAABBBB";
        store.put_chunk(&repo(), session, &mut chunk, 0).await.unwrap();

        let wrong = Digest::sha256(b"AAAA");
        assert!(matches!(
            store.complete(&repo(), session, &wrong).await,
            Err(StoreError::DigestMismatch { read: 8, .. })
        ));
        assert!(store.is_empty());

        let digest = Digest::sha256(b"AAAABBBB");
        store.complete(&repo(), session, &digest).await.unwrap();
        assert_eq!(read(&store, &digest).await, b"AAAABBBB");
        assert!(matches!(
            store.uploaded_size(&repo(), session).await,
            Err(StoreError::UploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn manifests_by_tag_and_digest() {
        let store = MemoryManifestStore::new();
        let m1 = manifest(b"one");
        let tag = Reference::Tag("v1".into());

        assert!(matches!(
            store.get(&repo(), &tag).await,
            Err(StoreError::NameUnknown(_))
        ));

        let mut tx = store.begin().await.unwrap();
        tx.put(&repo(), &Reference::Digest(m1.digest.clone()), &m1, &[])
            .await
            .unwrap();
        tx.put(&repo(), &tag, &m1, &[]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.get(&repo(), &tag).await.unwrap(), m1);
        assert_eq!(store.digests(&repo()).await.unwrap(), vec![m1.digest.clone()]);
        assert_eq!(store.tags(&repo(), None, None).await.unwrap(), ["v1"]);
        assert!(matches!(
            store.get(&repo(), &Reference::Tag("v2".into())).await,
            Err(StoreError::ManifestUnknown { .. })
        ));

        // Identical re-push is a no-op.
        store.put(&repo(), &tag, &m1, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_transactions_leave_nothing_behind() {
        let store = MemoryManifestStore::new();
        let m1 = manifest(b"one");
        let m2 = manifest(b"two");
        let tag = Reference::Tag("v1".into());
        store.put(&repo(), &tag, &m1, &[]).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.put(&repo(), &Reference::Digest(m2.digest.clone()), &m2, &[])
            .await
            .unwrap();
        let err = tx.put(&repo(), &tag, &m2, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::TagConflict { .. }));
        drop(tx);

        assert_eq!(store.get(&repo(), &tag).await.unwrap(), m1);
        assert!(store.digests(&repo()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repositories_are_sorted_and_capped() {
        let store = MemoryManifestStore::new();
        let m1 = manifest(b"one");
        for name in ["zeta/app", "acme/app", "beta/app"] {
            let repo: RepositoryName = name.parse().unwrap();
            store.put(&repo, &Reference::Tag("v1".into()), &m1, &[]).await.unwrap();
        }

        let names: Vec<String> = store
            .repositories(Some(2))
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, ["acme/app", "beta/app"]);
    }
}
