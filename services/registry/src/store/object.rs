//! Blob store on top of object storage.
//!
//! Blobs live at `blobs/<algorithm>/<hex>`. An upload session is a multipart upload
//! at `uploads/<organization>/<artifact>/<session>`; each chunk becomes one part.
//! Sessions are found again by listing in-progress multipart uploads, so no
//! session state is kept in the registry process beyond per-session locks.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use http::StatusCode;
use storage::{Part, StorageBucket, StorageError, UploadId};
use tokio::io::BufReader;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::blobs::{
    BlobDelete, BlobRead, BlobReader, BlobStat, BlobUploads, BlobWrite, BodyReader, Located,
    Redirect,
};
use super::StoreError;
use crate::digest::Digest;
use crate::ephemeral::{EphemeralFactory, EphemeralStream};
use crate::name::{RepositoryName, SessionId};
use crate::verify::DigestVerifier;

/// Largest listing the store requests; a fuller listing is an error.
///
/// Drivers with smaller pages lower the limit to their page size.
pub const MAX_LISTING: usize = 1000;

type SessionLocks = DashMap<SessionId, Arc<AsyncMutex<()>>>;

/// Exclusive access to one upload session.
///
/// The lock entry is removed when the last holder or waiter lets go, so the map
/// only holds sessions with writes in flight.
struct SessionGuard<'s> {
    sessions: &'s SessionLocks,
    session: SessionId,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // One reference is the map's, the other is ours.
        self.sessions.remove_if(&self.session, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

const UPLOADS: &str = "uploads";

/// How blob downloads are redirected to pre-signed URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectPolicy {
    /// Lifetime of each pre-signed URL.
    pub expires: Duration,
    /// Status code to redirect with.
    pub status: StatusCode,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self {
            expires: Duration::from_secs(15 * 60),
            status: StatusCode::TEMPORARY_REDIRECT,
        }
    }
}

/// Blob store backed by an object storage bucket.
#[derive(Debug)]
pub struct ObjectBlobStore {
    bucket: StorageBucket,
    ephemeral: EphemeralFactory,
    redirect: Option<RedirectPolicy>,
    sessions: SessionLocks,
}

fn blob_key(digest: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("blobs/{}/{}", digest.algorithm(), digest.hex()))
}

fn upload_key(repository: &RepositoryName, session: SessionId) -> Utf8PathBuf {
    Utf8PathBuf::from(format!(
        "{UPLOADS}/{}/{}/{session}",
        repository.organization(),
        repository.artifact()
    ))
}

impl ObjectBlobStore {
    /// Store blobs in `bucket`, spooling chunks with `ephemeral`.
    pub fn new(bucket: StorageBucket, ephemeral: EphemeralFactory) -> Self {
        Self {
            bucket,
            ephemeral,
            redirect: None,
            sessions: DashMap::new(),
        }
    }

    /// Redirect blob downloads to pre-signed URLs.
    pub fn with_redirect(mut self, policy: RedirectPolicy) -> Self {
        self.redirect = Some(policy);
        self
    }

    /// Wait for exclusive access to a session.
    async fn lock_session(&self, session: SessionId) -> SessionGuard<'_> {
        let lock = self.sessions.entry(session).or_default().clone();
        let mut held = SessionGuard {
            sessions: &self.sessions,
            session,
            lock: lock.clone(),
            guard: None,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    /// Most entries one listing can return without truncating.
    fn listing_limit(&self) -> usize {
        MAX_LISTING.min(self.bucket.page_limit())
    }

    /// Find the multipart upload backing a session.
    async fn find_upload(&self, key: &Utf8Path, session: SessionId) -> Result<UploadId, StoreError> {
        let page = self
            .bucket
            .list_multipart_uploads(Utf8Path::new(UPLOADS), self.listing_limit())
            .await?;

        if let Some(upload) = page.items.into_iter().find(|upload| upload.key == key) {
            return Ok(upload.upload_id);
        }
        if page.truncated {
            tracing::warn!(%session, "session not in first page of multipart uploads");
            return Err(StoreError::TooManyUploads);
        }
        Err(StoreError::UploadUnknown(session))
    }

    /// Every part committed to an upload.
    async fn parts(&self, key: &Utf8Path, upload: &UploadId) -> Result<Vec<Part>, StoreError> {
        let limit = self.listing_limit();
        let page = self.bucket.list_parts(key, upload, limit).await?;
        if page.truncated {
            return Err(StoreError::UploadTooLarge(format!(
                "more than {limit} parts in upload {upload}"
            )));
        }
        Ok(page.items)
    }

    fn committed(parts: &[Part]) -> u64 {
        parts.iter().map(|part| part.size).sum()
    }

    async fn exists(&self, digest: &Digest) -> Result<bool, StoreError> {
        match self.bucket.metadata(&blob_key(digest)).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Upload a spooled stream, then release it whatever the outcome.
    async fn upload_spooled(&self, key: &Utf8Path, mut stream: EphemeralStream) -> Result<(), StoreError> {
        let result = self.bucket.upload(key, &mut BufReader::new(&mut stream)).await;
        stream.destroy().await?;
        Ok(result?)
    }

    /// Read back an assembled upload, checking it hashes to `digest`.
    async fn verify_object(&self, key: &Utf8Path, digest: &Digest, size: u64) -> Result<(), StoreError> {
        let reader = self.bucket.open(key).await?;
        let mut verifier = DigestVerifier::new(reader, digest.clone(), size);
        tokio::io::copy(&mut verifier, &mut tokio::io::sink()).await?;
        Ok(())
    }

    fn not_found(digest: &Digest) -> impl FnOnce(StorageError) -> StoreError + '_ {
        move |error| {
            if error.is_not_found() {
                StoreError::NotFound(digest.clone())
            } else {
                error.into()
            }
        }
    }
}

#[async_trait::async_trait]
impl BlobRead for ObjectBlobStore {
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    async fn get(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        allow_redirect: bool,
    ) -> Result<Located<BlobReader>, StoreError> {
        let key = blob_key(digest);
        let metadata = self
            .bucket
            .metadata(&key)
            .await
            .map_err(Self::not_found(digest))?;

        if let (true, Some(policy)) = (allow_redirect, self.redirect) {
            if let Some(location) = self.bucket.presign(&key, policy.expires).await? {
                return Ok(Located::Redirect(Redirect {
                    location: location.to_string(),
                    status: policy.status,
                }));
            }
        }

        let reader = self
            .bucket
            .open(&key)
            .await
            .map_err(Self::not_found(digest))?;
        Ok(Located::Here(BlobReader {
            size: Some(metadata.size),
            reader,
        }))
    }
}

#[async_trait::async_trait]
impl BlobStat for ObjectBlobStore {
    async fn stat(
        &self,
        _repository: &RepositoryName,
        digest: &Digest,
    ) -> Result<Located<u64>, StoreError> {
        let metadata = self
            .bucket
            .metadata(&blob_key(digest))
            .await
            .map_err(Self::not_found(digest))?;
        Ok(Located::Here(metadata.size))
    }
}

#[async_trait::async_trait]
impl BlobWrite for ObjectBlobStore {
    #[tracing::instrument(skip(self, reader), fields(%repository, %digest))]
    async fn put(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        content_type: Option<&str>,
        reader: &mut BodyReader<'_>,
    ) -> Result<(), StoreError> {
        // Spooling drains the reader, so verification failures surface here,
        // before anything reaches the bucket.
        let stream = self.ephemeral.capture(reader).await?;
        if self.exists(digest).await? {
            stream.destroy().await?;
            tracing::debug!("blob already stored");
            return Ok(());
        }
        tracing::trace!(?content_type, bytes = stream.len(), "storing blob");
        self.upload_spooled(&blob_key(digest), stream).await
    }
}

#[async_trait::async_trait]
impl BlobUploads for ObjectBlobStore {
    #[tracing::instrument(skip(self), fields(%repository))]
    async fn start_session(&self, repository: &RepositoryName) -> Result<SessionId, StoreError> {
        let session = SessionId::generate();
        let upload = self
            .bucket
            .create_multipart(&upload_key(repository, session))
            .await?;
        tracing::debug!(%session, %upload, "started upload session");
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
        let _guard = self.lock_session(session).await;

        let key = upload_key(repository, session);
        let upload = self.find_upload(&key, session).await?;
        let parts = self.parts(&key, &upload).await?;
        let current = Self::committed(&parts);
        if offset != current {
            return Err(StoreError::BadUpload {
                expected: current,
                offset,
            });
        }
        // Another part would push the upload past what can be listed for completion.
        if parts.len() >= self.listing_limit() {
            return Err(StoreError::UploadTooLarge(format!(
                "upload {upload} already has {} parts",
                parts.len()
            )));
        }

        let mut stream = self.ephemeral.capture(reader).await?;
        if stream.is_empty() {
            stream.destroy().await?;
            return Ok(current);
        }

        let number = u32::try_from(parts.len() + 1)
            .map_err(|_| StoreError::UploadTooLarge(format!("too many parts in {upload}")))?;
        let result = self
            .bucket
            .upload_part(&key, &upload, number, &mut BufReader::new(&mut stream))
            .await;
        stream.destroy().await?;
        let part = result?;

        tracing::trace!(part = number, bytes = part.size, "appended chunk");
        Ok(current + part.size)
    }

    async fn uploaded_size(
        &self,
        repository: &RepositoryName,
        session: SessionId,
    ) -> Result<u64, StoreError> {
        let key = upload_key(repository, session);
        let upload = self.find_upload(&key, session).await?;
        let parts = self.parts(&key, &upload).await?;
        Ok(Self::committed(&parts))
    }

    #[tracing::instrument(skip(self), fields(%repository, %session, %digest))]
    async fn complete(
        &self,
        repository: &RepositoryName,
        session: SessionId,
        digest: &Digest,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_session(session).await;

        let key = upload_key(repository, session);
        let upload = self.find_upload(&key, session).await?;
        let parts = self.parts(&key, &upload).await?;
        let size = Self::committed(&parts);

        if parts.is_empty() {
            // Object stores refuse to complete an upload with no parts.
            let mut empty: &[u8] = &[];
            let mut verifier = DigestVerifier::new(&mut empty, digest.clone(), 0);
            tokio::io::copy(&mut verifier, &mut tokio::io::sink()).await?;
            self.bucket.upload(&blob_key(digest), &mut &b""[..]).await?;
            self.bucket.abort_multipart(&key, &upload).await?;
        } else {
            self.bucket.complete_multipart(&key, &upload, &parts).await?;

            if let Err(error) = self.verify_object(&key, digest, size).await {
                if let Err(cleanup) = self.bucket.delete(&key).await {
                    tracing::warn!(error = %cleanup, "failed to remove unverified upload");
                }
                return Err(error);
            }

            // Not atomic: a failure after this point leaves the assembled object at
            // the upload key, and the session must be replayed.
            self.bucket.copy(&key, &blob_key(digest)).await?;
            self.bucket.delete(&key).await?;
        }

        tracing::debug!(bytes = size, "completed upload session");
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobDelete for ObjectBlobStore {
    async fn delete(&self, _repository: &RepositoryName, _digest: &Digest) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("blob deletion"))
    }
}
