//! The blob store capability contract.
//!
//! Reading a blob by digest is the only operation every backend must offer. Stat,
//! put, chunked uploads and delete are separate traits, and a [`BlobStore`] records
//! which of them a backend provides. The router checks these capabilities once,
//! when the registry is built.

use std::fmt;
use std::sync::Arc;

use http::StatusCode;
use storage::ReadStream;
use tokio::io::AsyncRead;

use super::StoreError;
use crate::digest::Digest;
use crate::name::{RepositoryName, SessionId};

/// Request bodies handed to backends.
pub type BodyReader<'r> = dyn AsyncRead + Unpin + Send + 'r;

/// Instructs the protocol layer to send the client elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Where the content can be fetched.
    pub location: String,
    /// Redirect status to answer with.
    pub status: StatusCode,
}

/// The outcome of a lookup which may be served by someone else.
#[derive(Debug)]
pub enum Located<T> {
    /// Served by this registry.
    Here(T),
    /// Served from another location.
    Redirect(Redirect),
}

/// Blob content ready to stream.
pub struct BlobReader {
    /// Content length, when the backend knows it.
    pub size: Option<u64>,
    /// The content.
    pub reader: ReadStream,
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Read blobs by digest.
#[async_trait::async_trait]
pub trait BlobRead: fmt::Debug + Send + Sync {
    /// Open a blob, or say where else to fetch it when `allow_redirect` is set.
    async fn get(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        allow_redirect: bool,
    ) -> Result<Located<BlobReader>, StoreError>;
}

/// Report blob sizes without reading them.
#[async_trait::async_trait]
pub trait BlobStat: fmt::Debug + Send + Sync {
    /// Size of a blob.
    async fn stat(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
    ) -> Result<Located<u64>, StoreError>;
}

/// Store a blob in one request.
#[async_trait::async_trait]
pub trait BlobWrite: fmt::Debug + Send + Sync {
    /// Store the content read from `reader` under `digest`.
    ///
    /// Callers wrap `reader` in a [`DigestVerifier`](crate::verify::DigestVerifier)
    /// when the content is untrusted. A backend must not make the blob visible if
    /// reading fails.
    async fn put(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        content_type: Option<&str>,
        reader: &mut BodyReader<'_>,
    ) -> Result<(), StoreError>;
}

/// Resumable chunked uploads.
#[async_trait::async_trait]
pub trait BlobUploads: fmt::Debug + Send + Sync {
    /// Open a new upload session.
    async fn start_session(&self, repository: &RepositoryName) -> Result<SessionId, StoreError>;

    /// Append a chunk which must start at exactly `offset`, returning the new size.
    async fn put_chunk(
        &self,
        repository: &RepositoryName,
        session: SessionId,
        reader: &mut BodyReader<'_>,
        offset: u64,
    ) -> Result<u64, StoreError>;

    /// Bytes committed to the session so far.
    async fn uploaded_size(
        &self,
        repository: &RepositoryName,
        session: SessionId,
    ) -> Result<u64, StoreError>;

    /// Turn the committed chunks into the blob `digest`.
    async fn complete(
        &self,
        repository: &RepositoryName,
        session: SessionId,
        digest: &Digest,
    ) -> Result<(), StoreError>;
}

/// Remove blobs.
#[async_trait::async_trait]
pub trait BlobDelete: fmt::Debug + Send + Sync {
    /// Delete a blob.
    async fn delete(&self, repository: &RepositoryName, digest: &Digest) -> Result<(), StoreError>;
}

/// Which optional operations a [`BlobStore`] offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// [`BlobStat`]
    pub stat: bool,
    /// [`BlobWrite`]
    pub put: bool,
    /// [`BlobUploads`]
    pub uploads: bool,
    /// [`BlobDelete`]
    pub delete: bool,
}

/// A blob backend and the capabilities it was wired with.
#[derive(Debug, Clone)]
pub struct BlobStore {
    read: Arc<dyn BlobRead>,
    stat: Option<Arc<dyn BlobStat>>,
    write: Option<Arc<dyn BlobWrite>>,
    uploads: Option<Arc<dyn BlobUploads>>,
    delete: Option<Arc<dyn BlobDelete>>,
}

impl BlobStore {
    /// A store which can only serve blobs.
    pub fn read_only<B: BlobRead + 'static>(backend: Arc<B>) -> Self {
        Self {
            read: backend,
            stat: None,
            write: None,
            uploads: None,
            delete: None,
        }
    }

    /// A store offering every capability.
    pub fn full<B>(backend: Arc<B>) -> Self
    where
        B: BlobRead + BlobStat + BlobWrite + BlobUploads + BlobDelete + 'static,
    {
        Self {
            read: backend.clone(),
            stat: Some(backend.clone()),
            write: Some(backend.clone()),
            uploads: Some(backend.clone()),
            delete: Some(backend),
        }
    }

    /// Add the stat capability.
    pub fn with_stat(mut self, stat: Arc<dyn BlobStat>) -> Self {
        self.stat = Some(stat);
        self
    }

    /// Add the single-request put capability.
    pub fn with_write(mut self, write: Arc<dyn BlobWrite>) -> Self {
        self.write = Some(write);
        self
    }

    /// Add the chunked upload capability.
    pub fn with_uploads(mut self, uploads: Arc<dyn BlobUploads>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    /// Add the delete capability.
    pub fn with_delete(mut self, delete: Arc<dyn BlobDelete>) -> Self {
        self.delete = Some(delete);
        self
    }

    /// The capabilities this store was wired with.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            stat: self.stat.is_some(),
            put: self.write.is_some(),
            uploads: self.uploads.is_some(),
            delete: self.delete.is_some(),
        }
    }

    /// Blob reads.
    pub fn reader(&self) -> &dyn BlobRead {
        self.read.as_ref()
    }

    /// Blob stats, if supported.
    pub fn stat(&self) -> Option<&dyn BlobStat> {
        self.stat.as_deref()
    }

    /// Single-request puts, or [`StoreError::Unsupported`].
    pub fn writer(&self) -> Result<&dyn BlobWrite, StoreError> {
        self.write
            .as_deref()
            .ok_or(StoreError::Unsupported("blob upload"))
    }

    /// Chunked uploads, or [`StoreError::Unsupported`].
    pub fn uploads(&self) -> Result<&dyn BlobUploads, StoreError> {
        self.uploads
            .as_deref()
            .ok_or(StoreError::Unsupported("chunked blob upload"))
    }

    /// Deletes, or [`StoreError::Unsupported`].
    pub fn deleter(&self) -> Result<&dyn BlobDelete, StoreError> {
        self.delete
            .as_deref()
            .ok_or(StoreError::Unsupported("blob deletion"))
    }
}
