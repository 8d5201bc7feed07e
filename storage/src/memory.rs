use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use http::Uri;
use tokio::{io::AsyncReadExt, sync::RwLock};
use url::Url;

use storage_driver::{
    Driver, Metadata, MultipartUpload, Page, Part, ReadStream, Reader, StorageError,
    StorageErrorKind, UploadId,
};

const ENGINE: &str = "memory";

/// Helper to convert io::Error to StorageError with appropriate kind detection
fn io_error_to_storage(err: std::io::Error) -> StorageError {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Io,
    };
    StorageError::new(ENGINE, kind, err)
}

fn bucket_not_found(bucket: &str) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        format!("Bucket not found: {bucket}"),
    )
    .bucket(bucket)
    .context("bucket not found")
    .build()
}

fn upload_not_found(bucket: &str, remote: &Utf8Path, upload: &UploadId) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        format!("Multipart upload not found: {upload}"),
    )
    .bucket(bucket)
    .path(remote.as_str())
    .context("multipart upload not found")
    .build()
}

fn invalid_request(bucket: &str, remote: &Utf8Path, message: String) -> StorageError {
    StorageError::builder(ENGINE, StorageErrorKind::InvalidRequest, message)
        .bucket(bucket)
        .path(remote.as_str())
        .build()
}

#[derive(Debug, Clone)]
struct MemoryObject {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Bytes> for MemoryObject {
    fn from(data: Bytes) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

#[derive(Debug)]
struct MemoryMultipart {
    key: Utf8PathBuf,
    initiated: DateTime<Utc>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct MemoryBucket {
    objects: BTreeMap<Utf8PathBuf, MemoryObject>,
    uploads: BTreeMap<UploadId, MemoryMultipart>,
}

impl MemoryBucket {
    fn multipart(
        &mut self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<&mut MemoryMultipart, StorageError> {
        match self.uploads.get_mut(upload) {
            Some(multipart) if multipart.key == remote => Ok(multipart),
            _ => Err(upload_not_found(bucket, remote, upload)),
        }
    }
}

/// Storage driver that keeps objects and multipart uploads in memory.
///
/// Listings are capped at the configured page size (1000 by default) and
/// report truncation, mirroring hosted object stores.
#[derive(Debug)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, MemoryBucket>>,
    uploads: AtomicU64,
    page_size: usize,
    presign: Option<Url>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            buckets: RwLock::default(),
            uploads: AtomicU64::new(1),
            page_size: crate::DEFAULT_PAGE_SIZE,
            presign: None,
        }
    }
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), MemoryBucket::default());
        }

        Self {
            buckets: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Cap the number of entries returned by a single listing.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Hand out pre-signed URLs rooted at `base`.
    ///
    /// The URL has the form `{base}/{bucket}/{path}?expires={seconds}`.
    pub fn with_presign_base(mut self, base: Url) -> Self {
        self.presign = Some(base);
        self
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }
}

async fn read_all(reader: &mut Reader<'_>) -> Result<Bytes, StorageError> {
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(io_error_to_storage)?;
    Ok(buf.into())
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    fn page_limit(&self) -> usize {
        self.page_size
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        Ok(bucket_map
            .objects
            .get(remote)
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, remote.as_str()))?
            .into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;
        bucket_map.objects.remove(remote);

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        // Drain the reader before taking the lock: a failing reader stores nothing.
        let data = read_all(local).await?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.objects.insert(remote.to_owned(), data.into());

        Ok(())
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ReadStream, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        let data = bucket_map
            .objects
            .get(remote)
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, remote.as_str()))?
            .data
            .clone();

        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn copy(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;
        let object = bucket_map
            .objects
            .get(from)
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, from.as_str()))?
            .data
            .clone();
        bucket_map.objects.insert(to.to_owned(), object.into());
        Ok(())
    }

    async fn presign(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires: Duration,
    ) -> Result<Option<Uri>, StorageError> {
        let Some(base) = &self.presign else {
            return Ok(None);
        };

        // Only existing objects get a URL, like a HEAD-checked signer would.
        self.metadata(bucket, remote).await?;

        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                invalid_request(bucket, remote, format!("presign base cannot be a base: {base}"))
            })?
            .pop_if_empty()
            .push(bucket)
            .extend(remote.iter());
        url.query_pairs_mut()
            .append_pair("expires", &expires.as_secs().to_string());

        let uri = url
            .as_str()
            .parse::<Uri>()
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?;
        Ok(Some(uri))
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        let id = UploadId::new(format!(
            "upload-{:016x}",
            self.uploads.fetch_add(1, Ordering::Relaxed)
        ));

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.uploads.insert(
            id.clone(),
            MemoryMultipart {
                key: remote.to_owned(),
                initiated: Utc::now(),
                parts: BTreeMap::new(),
            },
        );
        tracing::trace!(%bucket, %remote, upload=%id, "created multipart upload");

        Ok(id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        number: u32,
        reader: &mut Reader<'_>,
    ) -> Result<Part, StorageError> {
        if number == 0 {
            return Err(invalid_request(
                bucket,
                remote,
                "part numbers start at 1".to_string(),
            ));
        }

        let data = read_all(reader).await?;
        let etag = format!("\"{number:05}-{:x}\"", data.len());
        let size = data.len() as u64;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;
        let multipart = bucket_map.multipart(bucket, remote, upload)?;
        multipart.parts.insert(number, (etag.clone(), data));

        Ok(Part { number, size, etag })
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
        max: usize,
    ) -> Result<Page<MultipartUpload>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory multipart uploads");
        let max = max.min(self.page_size);

        let buckets = self.buckets.read().await;
        let Some(bucket_map) = buckets.get(bucket) else {
            return Ok(Page::complete(Vec::new()));
        };

        let mut matching = bucket_map
            .uploads
            .iter()
            .filter(|(_, multipart)| prefix.is_none_or(|prefix| multipart.key.starts_with(prefix)))
            .map(|(id, multipart)| MultipartUpload {
                key: multipart.key.clone(),
                upload_id: id.clone(),
                initiated: multipart.initiated,
            });

        let items: Vec<_> = matching.by_ref().take(max).collect();
        let truncated = matching.next().is_some();
        Ok(Page { items, truncated })
    }

    async fn list_parts(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        max: usize,
    ) -> Result<Page<Part>, StorageError> {
        let max = max.min(self.page_size);

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;
        let multipart = bucket_map.multipart(bucket, remote, upload)?;

        let mut parts = multipart.parts.iter().map(|(number, (etag, data))| Part {
            number: *number,
            size: data.len() as u64,
            etag: etag.clone(),
        });
        let items: Vec<_> = parts.by_ref().take(max).collect();
        let truncated = parts.next().is_some();
        Ok(Page { items, truncated })
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        parts: &[Part],
    ) -> Result<(), StorageError> {
        if parts.is_empty() {
            return Err(invalid_request(
                bucket,
                remote,
                "cannot complete a multipart upload without parts".to_string(),
            ));
        }

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;
        let multipart = bucket_map.multipart(bucket, remote, upload)?;

        let mut assembled = Vec::new();
        let mut previous = 0;
        for part in parts {
            if part.number <= previous {
                return Err(invalid_request(
                    bucket,
                    remote,
                    format!("parts out of order at part {}", part.number),
                ));
            }
            previous = part.number;

            match multipart.parts.get(&part.number) {
                Some((etag, data)) if *etag == part.etag => assembled.extend_from_slice(data),
                _ => {
                    return Err(invalid_request(
                        bucket,
                        remote,
                        format!("part {} does not match an uploaded part", part.number),
                    ))
                }
            }
        }

        bucket_map.uploads.remove(upload);
        bucket_map
            .objects
            .insert(remote.to_owned(), Bytes::from(assembled).into());
        tracing::trace!(%bucket, %remote, upload=%upload, "completed multipart upload");

        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;
        bucket_map.multipart(bucket, remote, upload)?;
        bucket_map.uploads.remove(upload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn read(storage: &MemoryStorage, bucket: &str, remote: &str) -> Vec<u8> {
        let mut stream = storage.open(bucket, Utf8Path::new(remote)).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn upload_open_and_copy() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let mut data: &[u8] = b"hello world";
        storage
            .upload("test", Utf8Path::new("a/b"), &mut data)
            .await
            .unwrap();

        assert_eq!(read(&storage, "test", "a/b").await, b"hello world");
        assert_eq!(
            storage.metadata("test", Utf8Path::new("a/b")).await.unwrap().size,
            11
        );

        storage
            .copy("test", Utf8Path::new("a/b"), Utf8Path::new("c/d"))
            .await
            .unwrap();
        assert_eq!(read(&storage, "test", "c/d").await, b"hello world");

        storage.delete("test", Utf8Path::new("a/b")).await.unwrap();
        let err = storage.metadata("test", Utf8Path::new("a/b")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn multipart_assembles_parts_in_order() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let key = Utf8Path::new("uploads/x");
        let id = storage.create_multipart("test", key).await.unwrap();

        let mut first: &[u8] = b"AAAA";
        let mut second: &[u8] = b"BB";
        let p1 = storage
            .upload_part("test", key, &id, 1, &mut first)
            .await
            .unwrap();
        let p2 = storage
            .upload_part("test", key, &id, 2, &mut second)
            .await
            .unwrap();

        let listed = storage.list_parts("test", key, &id, 1000).await.unwrap();
        assert_eq!(listed.items, vec![p1.clone(), p2.clone()]);
        assert!(!listed.truncated);

        storage
            .complete_multipart("test", key, &id, &[p1, p2])
            .await
            .unwrap();
        assert_eq!(read(&storage, "test", "uploads/x").await, b"AAAABB");

        let err = storage
            .list_parts("test", key, &id, 1000)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn listings_report_truncation() {
        let storage = MemoryStorage::with_buckets(&["test"]).with_page_size(2);
        assert_eq!(storage.page_limit(), 2);
        for name in ["uploads/1", "uploads/2", "uploads/3"] {
            storage
                .create_multipart("test", Utf8Path::new(name))
                .await
                .unwrap();
        }

        let page = storage
            .list_multipart_uploads("test", Some(Utf8Path::new("uploads")), 1000)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.truncated);

        let page = storage
            .list_multipart_uploads("test", Some(Utf8Path::new("other")), 1000)
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert!(!page.truncated);
    }

    #[tokio::test]
    async fn complete_rejects_unknown_parts() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let key = Utf8Path::new("uploads/y");
        let id = storage.create_multipart("test", key).await.unwrap();

        let bogus = Part {
            number: 1,
            size: 3,
            etag: "nope".to_string(),
        };
        let err = storage
            .complete_multipart("test", key, &id, &[bogus])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn presign_requires_base_and_object() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let mut data: &[u8] = b"x";
        storage
            .upload("test", Utf8Path::new("blobs/sha256/ab"), &mut data)
            .await
            .unwrap();
        assert!(storage
            .presign("test", Utf8Path::new("blobs/sha256/ab"), Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        let storage = storage.with_presign_base("https://cdn.example.com/".parse().unwrap());
        let uri = storage
            .presign("test", Utf8Path::new("blobs/sha256/ab"), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            uri.to_string(),
            "https://cdn.example.com/test/blobs/sha256/ab?expires=60"
        );
    }
}
