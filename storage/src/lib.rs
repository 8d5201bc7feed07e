//! # Storage backends
//!
//! Configuration and unification for the object-storage backends used by the
//! registry. A [`Storage`] wraps any [`Driver`]; a [`StorageBucket`] binds it
//! to one bucket.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use http::Uri;
use serde::Deserialize;
use url::Url;

#[cfg(feature = "local")]
pub(crate) mod local;
pub(crate) mod memory;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[doc(inline)]
pub use storage_driver::{
    Driver, Metadata, MultipartUpload, Page, Part, ReadStream, Reader, StorageError,
    StorageErrorKind, UploadId,
};

/// Listing page size used by backends which do not say otherwise.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Backend selection, as read from configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case", tag = "driver")]
pub enum StorageConfig {
    /// Keep everything in process memory.
    Memory {
        /// Bucket to create up front.
        bucket: String,

        /// Base URL for pre-signed object URLs.
        #[serde(default)]
        presign: Option<Url>,

        /// Listing page size.
        #[serde(default)]
        page_size: Option<usize>,
    },

    /// Keep buckets as directories on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Directory holding the buckets.
        path: Utf8PathBuf,

        /// Listing page size.
        #[serde(default)]
        page_size: Option<usize>,
    },
}

impl StorageConfig {
    /// Construct the configured driver.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory {
                bucket,
                presign,
                page_size,
            } => {
                let mut memory = MemoryStorage::with_buckets(&[&bucket]);
                if let Some(base) = presign {
                    memory = memory.with_presign_base(base);
                }
                if let Some(page_size) = page_size {
                    memory = memory.with_page_size(page_size);
                }
                memory.into()
            }
            #[cfg(feature = "local")]
            StorageConfig::Local { path, page_size } => {
                let mut local = LocalDriver::new(path);
                if let Some(page_size) = page_size {
                    local = local.with_page_size(page_size);
                }
                local.into()
            }
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A shared handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The driver name, for logging.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Bind this storage to a bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// A storage driver bound to a single bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket all operations address.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The driver name, for logging.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// Most entries a single listing returns.
    pub fn page_limit(&self) -> usize {
        self.driver.page_limit()
    }

    /// Object metadata.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Open an object for streaming reads.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn open(&self, remote: &Utf8Path) -> Result<ReadStream, StorageError> {
        self.driver.open(&self.bucket, remote).await
    }

    /// Upload an object from a reader.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn upload<'d, R>(&'d self, remote: &Utf8Path, reader: &mut R) -> Result<(), StorageError>
    where
        R: tokio::io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote, reader).await
    }

    /// Copy an object within the bucket.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn copy(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.copy(&self.bucket, from, to).await
    }

    /// Delete an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, remote).await
    }

    /// Pre-signed URL for an object, if the driver supports it.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn presign(
        &self,
        remote: &Utf8Path,
        expires: Duration,
    ) -> Result<Option<Uri>, StorageError> {
        self.driver.presign(&self.bucket, remote, expires).await
    }

    /// Start a multipart upload.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn create_multipart(&self, remote: &Utf8Path) -> Result<UploadId, StorageError> {
        self.driver.create_multipart(&self.bucket, remote).await
    }

    /// Upload one part of a multipart upload.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn upload_part<'d, R>(
        &'d self,
        remote: &Utf8Path,
        upload: &UploadId,
        number: u32,
        reader: &mut R,
    ) -> Result<Part, StorageError>
    where
        R: tokio::io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        self.driver
            .upload_part(&self.bucket, remote, upload, number, reader)
            .await
    }

    /// List in-progress multipart uploads under a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn list_multipart_uploads(
        &self,
        prefix: &Utf8Path,
        max: usize,
    ) -> Result<Page<MultipartUpload>, StorageError> {
        self.driver
            .list_multipart_uploads(&self.bucket, Some(prefix), max)
            .await
    }

    /// List committed parts of a multipart upload.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn list_parts(
        &self,
        remote: &Utf8Path,
        upload: &UploadId,
        max: usize,
    ) -> Result<Page<Part>, StorageError> {
        self.driver
            .list_parts(&self.bucket, remote, upload, max)
            .await
    }

    /// Complete a multipart upload.
    #[tracing::instrument(skip(self, parts), fields(driver=self.driver.name(), bucket=self.bucket, parts=parts.len()))]
    pub async fn complete_multipart(
        &self,
        remote: &Utf8Path,
        upload: &UploadId,
        parts: &[Part],
    ) -> Result<(), StorageError> {
        self.driver
            .complete_multipart(&self.bucket, remote, upload, parts)
            .await
    }

    /// Abort a multipart upload.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn abort_multipart(
        &self,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        self.driver
            .abort_multipart(&self.bucket, remote, upload)
            .await
    }
}
