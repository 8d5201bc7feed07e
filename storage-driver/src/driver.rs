#![allow(clippy::needless_pass_by_ref_mut)]

use std::{fmt, ops::Deref, sync::Arc, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use http::Uri;
use tokio::io;

use crate::error::StorageError;

/// A reader stream for object contents being uploaded.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// An owned stream over the contents of a stored object.
pub type ReadStream = Box<dyn io::AsyncRead + Unpin + Send + Sync + 'static>;

/// Object metadata, which will be generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The creation timestamp of the object.
    pub created: DateTime<Utc>,
}

/// Identifier assigned by the backend to an in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadId(String);

impl UploadId {
    /// Wrap a backend-provided upload identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An in-progress multipart upload, as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    /// The object key the upload will produce once completed.
    pub key: Utf8PathBuf,

    /// The backend identifier of the upload.
    pub upload_id: UploadId,

    /// When the upload was started.
    pub initiated: DateTime<Utc>,
}

/// A part which has been committed to a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// One-based part number.
    pub number: u32,

    /// Size of the part in bytes.
    pub size: u64,

    /// Opaque entity tag returned by the backend, required to complete the upload.
    pub etag: String,
}

/// One page of a listing.
///
/// `truncated` is set when the backend had more entries than it returned.
/// Callers decide whether that is acceptable; drivers never silently drop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Entries on this page.
    pub items: Vec<T>,

    /// Whether more entries exist beyond this page.
    pub truncated: bool,
}

impl<T> Page<T> {
    /// A complete listing which fit in a single page.
    pub fn complete(items: Vec<T>) -> Self {
        Self {
            items,
            truncated: false,
        }
    }
}

/// An object-storage driver: the client used to reach a backend.
///
/// Besides plain object access, drivers provide the multipart primitives
/// (start, upload part, list uploads, list parts, complete, abort) and
/// server-side copy used by the registry for resumable uploads.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// The Uri scheme of the driver.
    fn scheme(&self) -> &str;

    /// Most entries a single listing call returns, whatever `max` asks for.
    fn page_limit(&self) -> usize {
        usize::MAX
    }

    /// Delete an object from the storage, by path.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for an object, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Upload an object, using a reader stream to provide the contents.
    ///
    /// If the reader fails, nothing is stored at `remote`.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Open an object for streaming reads.
    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ReadStream, StorageError>;

    /// Copy an object within a bucket.
    async fn copy(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError>;

    /// Produce a pre-signed URL granting temporary read access to an object.
    ///
    /// Drivers without pre-signing return `Ok(None)`.
    async fn presign(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires: Duration,
    ) -> Result<Option<Uri>, StorageError> {
        let _ = (bucket, remote, expires);
        Ok(None)
    }

    /// Start a multipart upload which will produce the object at `remote`.
    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError>;

    /// Upload one part of a multipart upload.
    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        number: u32,
        reader: &mut Reader<'_>,
    ) -> Result<Part, StorageError>;

    /// List in-progress multipart uploads, returning at most `max` entries.
    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
        max: usize,
    ) -> Result<Page<MultipartUpload>, StorageError>;

    /// List the committed parts of a multipart upload, returning at most `max` entries.
    async fn list_parts(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        max: usize,
    ) -> Result<Page<Part>, StorageError>;

    /// Assemble the given parts into the object at `remote`, ending the upload.
    async fn complete_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        parts: &[Part],
    ) -> Result<(), StorageError>;

    /// Discard a multipart upload and its parts.
    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    fn scheme(&self) -> &str {
        self.deref().scheme()
    }

    fn page_limit(&self) -> usize {
        self.deref().page_limit()
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ReadStream, StorageError> {
        self.deref().open(bucket, remote).await
    }

    async fn copy(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.deref().copy(bucket, from, to).await
    }

    async fn presign(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires: Duration,
    ) -> Result<Option<Uri>, StorageError> {
        self.deref().presign(bucket, remote, expires).await
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        self.deref().create_multipart(bucket, remote).await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        number: u32,
        reader: &mut Reader<'_>,
    ) -> Result<Part, StorageError> {
        self.deref()
            .upload_part(bucket, remote, upload, number, reader)
            .await
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
        max: usize,
    ) -> Result<Page<MultipartUpload>, StorageError> {
        self.deref()
            .list_multipart_uploads(bucket, prefix, max)
            .await
    }

    async fn list_parts(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        max: usize,
    ) -> Result<Page<Part>, StorageError> {
        self.deref().list_parts(bucket, remote, upload, max).await
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        parts: &[Part],
    ) -> Result<(), StorageError> {
        self.deref()
            .complete_multipart(bucket, remote, upload, parts)
            .await
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        self.deref().abort_multipart(bucket, remote, upload).await
    }
}
