//! Objects and multipart uploads on the local filesystem.
//!
//! Each bucket is a directory under the driver root:
//!
//! - `b/<key>` holds stored objects,
//! - `m/<upload>/key` names the object a multipart upload will produce, and its
//!   parts sit beside it, named by zero-padded part number,
//! - `t/` stages writes, which are renamed into place once complete.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use storage_driver::{
    Driver, Metadata, MultipartUpload, Page, Part, ReadStream, Reader, StorageError,
    StorageErrorKind, UploadId,
};

const ENGINE: &str = "local";
const KEY_FILE: &str = "key";

fn io_error(
    bucket: &str,
    path: &Utf8Path,
    context: &'static str,
) -> impl FnOnce(io::Error) -> StorageError {
    let bucket = bucket.to_owned();
    let path = path.to_string();
    move |error| {
        let kind = match error.kind() {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        StorageError::builder(ENGINE, kind, error)
            .bucket(bucket)
            .path(path)
            .context(context)
            .build()
    }
}

fn invalid_request(bucket: &str, remote: &Utf8Path, message: String) -> StorageError {
    StorageError::builder(ENGINE, StorageErrorKind::InvalidRequest, message)
        .bucket(bucket)
        .path(remote.as_str())
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

fn is_plain(path: &Utf8Path) -> bool {
    !path.as_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)))
}

fn part_name(number: u32) -> String {
    format!("{number:010}")
}

fn etag(number: u32, size: u64) -> String {
    format!("\"{number:05}-{size:x}\"")
}

fn created(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

async fn write_file(path: &Utf8Path, reader: &mut Reader<'_>) -> io::Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let size = tokio::io::copy_buf(reader, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}

/// Storage driver keeping buckets as directories under a root.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
    page_size: usize,
    counter: AtomicU64,
}

impl LocalDriver {
    /// Keep buckets under `root`, which is created on first write.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            page_size: crate::DEFAULT_PAGE_SIZE,
            counter: AtomicU64::new(0),
        }
    }

    /// Cap the number of entries returned by a single listing.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn object(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        if !is_plain(Utf8Path::new(bucket)) || !is_plain(remote) {
            return Err(invalid_request(
                bucket,
                remote,
                format!("invalid object key: {remote}"),
            ));
        }
        let mut path = self.root.join(bucket);
        path.push("b");
        path.push(remote);
        Ok(path)
    }

    fn uploads(&self, bucket: &str) -> Utf8PathBuf {
        self.root.join(bucket).join("m")
    }

    /// The directory of an upload, checking that it will produce `remote`.
    async fn multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<Utf8PathBuf, StorageError> {
        let id = Utf8Path::new(upload.as_str());
        if !is_plain(id) || id.components().count() != 1 {
            return Err(upload_not_found(bucket, remote, upload));
        }
        let dir = self.uploads(bucket).join(id);
        match tokio::fs::read_to_string(dir.join(KEY_FILE)).await {
            Ok(key) if key == remote.as_str() => Ok(dir),
            Ok(_) => Err(upload_not_found(bucket, remote, upload)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(upload_not_found(bucket, remote, upload))
            }
            Err(error) => Err(io_error(bucket, &dir, "read upload key")(error)),
        }
    }

    /// Every part in an upload directory, in part order.
    async fn parts(&self, bucket: &str, dir: &Utf8Path) -> Result<Vec<Part>, StorageError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(io_error(bucket, dir, "list parts"))?;
        let mut parts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error(bucket, dir, "list parts"))?
        {
            let Some(number) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let size = entry
                .metadata()
                .await
                .map_err(io_error(bucket, dir, "part metadata"))?
                .len();
            parts.push(Part {
                number,
                size,
                etag: etag(number, size),
            });
        }
        parts.sort_by_key(|part| part.number);
        Ok(parts)
    }

    /// A fresh path in the bucket's staging directory.
    async fn staging(&self, bucket: &str) -> Result<Utf8PathBuf, StorageError> {
        let dir = self.root.join(bucket).join("t");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error(bucket, &dir, "create staging directory"))?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(dir.join(format!("{}-{n}", std::process::id())))
    }

    /// Move a staged file to `target`, creating parent directories.
    async fn place(
        &self,
        bucket: &str,
        staged: &Utf8Path,
        target: &Utf8Path,
    ) -> Result<(), StorageError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(bucket, parent, "create_dir_all"))?;
        }
        tokio::fs::rename(staged, target)
            .await
            .map_err(io_error(bucket, target, "move into place"))
    }

    /// Stage `reader` to a file, then move it to `target`.
    async fn write(
        &self,
        bucket: &str,
        target: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let staged = self.staging(bucket).await?;
        let size = match write_file(&staged, reader).await {
            Ok(size) => size,
            Err(error) => {
                if let Err(cleanup) = tokio::fs::remove_file(&staged).await {
                    tracing::warn!(error = %cleanup, %staged, "failed to remove staged file");
                }
                return Err(io_error(bucket, target, "write")(error));
            }
        };
        self.place(bucket, &staged, target).await?;
        Ok(size)
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "local"
    }

    fn page_limit(&self) -> usize {
        self.page_size
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.object(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(io_error(bucket, remote, "metadata"))?;
        if !metadata.is_file() {
            return Err(StorageError::not_found(ENGINE, bucket, remote.as_str()));
        }
        Ok(Metadata {
            size: metadata.len(),
            created: created(&metadata),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.object(bucket, remote)?;
        match tokio::fs::remove_file(&path).await {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                Err(io_error(bucket, remote, "remove_file")(error))
            }
            _ => Ok(()),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.object(bucket, remote)?;
        let size = self.write(bucket, &path, local).await?;
        tracing::trace!(%bucket, %remote, bytes = size, "stored object");
        Ok(())
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ReadStream, StorageError> {
        let path = self.object(bucket, remote)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(io_error(bucket, remote, "open"))?;
        Ok(Box::new(file))
    }

    async fn copy(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let source = self.object(bucket, from)?;
        let target = self.object(bucket, to)?;
        let staged = self.staging(bucket).await?;
        tokio::fs::copy(&source, &staged)
            .await
            .map_err(io_error(bucket, from, "copy"))?;
        self.place(bucket, &staged, &target).await
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        self.object(bucket, remote)?;
        let id = UploadId::new(format!(
            "{:x}-{:x}",
            Utc::now().timestamp_micros(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        ));

        let dir = self.uploads(bucket).join(id.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error(bucket, &dir, "create upload directory"))?;
        tokio::fs::write(dir.join(KEY_FILE), remote.as_str())
            .await
            .map_err(io_error(bucket, &dir, "write upload key"))?;
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

        let dir = self.multipart(bucket, remote, upload).await?;
        let size = self.write(bucket, &dir.join(part_name(number)), reader).await?;
        Ok(Part {
            number,
            size,
            etag: etag(number, size),
        })
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
        max: usize,
    ) -> Result<Page<MultipartUpload>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list local multipart uploads");
        let max = max.min(self.page_size);
        let root = self.uploads(bucket);

        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(Page::complete(Vec::new()));
            }
            Err(error) => return Err(io_error(bucket, &root, "list uploads")(error)),
        };

        let mut uploads = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error(bucket, &root, "list uploads"))?
        {
            let Ok(id) = entry.file_name().into_string() else {
                continue;
            };
            let key_file = root.join(&id).join(KEY_FILE);
            // An upload completed or aborted mid-listing simply drops out.
            let key = match tokio::fs::read_to_string(&key_file).await {
                Ok(key) => Utf8PathBuf::from(key),
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => return Err(io_error(bucket, &key_file, "read upload key")(error)),
            };
            if prefix.is_some_and(|prefix| !key.starts_with(prefix)) {
                continue;
            }
            let initiated = match tokio::fs::metadata(&key_file).await {
                Ok(metadata) => created(&metadata),
                Err(_) => Utc::now(),
            };
            uploads.push(MultipartUpload {
                key,
                upload_id: UploadId::new(id),
                initiated,
            });
        }
        uploads.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));

        let truncated = uploads.len() > max;
        uploads.truncate(max);
        Ok(Page {
            items: uploads,
            truncated,
        })
    }

    async fn list_parts(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        max: usize,
    ) -> Result<Page<Part>, StorageError> {
        let max = max.min(self.page_size);
        let dir = self.multipart(bucket, remote, upload).await?;
        let mut parts = self.parts(bucket, &dir).await?;
        let truncated = parts.len() > max;
        parts.truncate(max);
        Ok(Page {
            items: parts,
            truncated,
        })
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

        let dir = self.multipart(bucket, remote, upload).await?;
        let uploaded = self.parts(bucket, &dir).await?;

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
            if !uploaded.contains(part) {
                return Err(invalid_request(
                    bucket,
                    remote,
                    format!("part {} does not match an uploaded part", part.number),
                ));
            }
        }

        let staged = self.staging(bucket).await?;
        let assembled = async {
            let mut file = tokio::fs::File::create(&staged).await?;
            for part in parts {
                let mut source = tokio::fs::File::open(dir.join(part_name(part.number))).await?;
                tokio::io::copy(&mut source, &mut file).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(error) = assembled {
            if let Err(cleanup) = tokio::fs::remove_file(&staged).await {
                tracing::warn!(error = %cleanup, %staged, "failed to remove staged file");
            }
            return Err(io_error(bucket, remote, "assemble parts")(error));
        }

        self.place(bucket, &staged, &self.object(bucket, remote)?)
            .await?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(io_error(bucket, &dir, "remove upload directory"))?;
        tracing::trace!(%bucket, %remote, upload=%upload, "completed multipart upload");
        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        let dir = self.multipart(bucket, remote, upload).await?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(io_error(bucket, &dir, "remove upload directory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn driver(dir: &tempfile::TempDir) -> LocalDriver {
        LocalDriver::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap())
    }

    async fn read(driver: &LocalDriver, bucket: &str, remote: &str) -> Vec<u8> {
        let mut reader = driver.open(bucket, Utf8Path::new(remote)).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn objects_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir);
        let key = Utf8Path::new("blobs/sha256/ab");

        let mut data: &[u8] = b"hello";
        driver.upload("test", key, &mut data).await.unwrap();
        assert_eq!(driver.metadata("test", key).await.unwrap().size, 5);
        assert_eq!(read(&driver, "test", "blobs/sha256/ab").await, b"hello");

        driver
            .copy("test", key, Utf8Path::new("copies/ab"))
            .await
            .unwrap();
        assert_eq!(read(&driver, "test", "copies/ab").await, b"hello");

        driver.delete("test", key).await.unwrap();
        assert!(driver.metadata("test", key).await.unwrap_err().is_not_found());
        driver.delete("test", key).await.unwrap();
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir);
        let mut data: &[u8] = b"x";
        let err = driver
            .upload("test", Utf8Path::new("../outside"), &mut data)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn multipart_uploads_assemble_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir);
        let key = Utf8Path::new("uploads/acme/app/1");

        let id = driver.create_multipart("test", key).await.unwrap();
        let mut chunk: &[u8] = b"AAAA";
        let p1 = driver
            .upload_part("test", key, &id, 1, &mut chunk)
            .await
            .unwrap();
        let mut chunk: &[u8] = b"BB";
        let p2 = driver
            .upload_part("test", key, &id, 2, &mut chunk)
            .await
            .unwrap();

        let listed = driver.list_parts("test", key, &id, 1000).await.unwrap();
        assert_eq!(listed.items, vec![p1.clone(), p2.clone()]);
        assert!(!listed.truncated);

        let uploads = driver
            .list_multipart_uploads("test", Some(Utf8Path::new("uploads")), 1000)
            .await
            .unwrap();
        assert_eq!(uploads.items.len(), 1);
        assert_eq!(uploads.items[0].key, key);

        driver
            .complete_multipart("test", key, &id, &[p1, p2])
            .await
            .unwrap();
        assert_eq!(read(&driver, "test", "uploads/acme/app/1").await, b"AAAABB");
        assert!(driver
            .list_parts("test", key, &id, 1000)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn listings_report_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir).with_page_size(2);
        assert_eq!(driver.page_limit(), 2);
        for name in ["uploads/1", "uploads/2", "uploads/3"] {
            driver
                .create_multipart("test", Utf8Path::new(name))
                .await
                .unwrap();
        }

        let page = driver
            .list_multipart_uploads("test", Some(Utf8Path::new("uploads")), 1000)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.truncated);

        let page = driver
            .list_multipart_uploads("test", Some(Utf8Path::new("other")), 1000)
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert!(!page.truncated);
    }

    #[tokio::test]
    async fn aborted_uploads_disappear() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir);
        let key = Utf8Path::new("uploads/x");
        let id = driver.create_multipart("test", key).await.unwrap();

        assert!(driver
            .abort_multipart("test", Utf8Path::new("uploads/y"), &id)
            .await
            .unwrap_err()
            .is_not_found());

        driver.abort_multipart("test", key, &id).await.unwrap();
        let page = driver
            .list_multipart_uploads("test", None, 1000)
            .await
            .unwrap();
        assert!(page.items.is_empty());
    }
}
