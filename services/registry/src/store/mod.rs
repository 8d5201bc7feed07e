//! Storage contracts for blobs and manifests, and their backends.

use std::io;

use storage::StorageError;

use crate::digest::Digest;
use crate::metadata::MetadataError;
use crate::name::{Reference, RepositoryName, SessionId};
use crate::verify::VerifyError;

pub mod blobs;
pub mod manifests;
pub mod memory;
pub mod metadata;
pub mod object;

pub use self::blobs::{
    BlobDelete, BlobRead, BlobReader, BlobStat, BlobStore, BlobUploads, BlobWrite, BodyReader,
    Capabilities, Located, Redirect,
};
pub use self::manifests::{Manifest, ManifestStore, ManifestTransaction};
pub use self::memory::{MemoryBlobStore, MemoryManifestStore};
pub use self::metadata::MetadataManifestStore;
pub use self::object::{ObjectBlobStore, RedirectPolicy};

/// Errors raised by blob and manifest stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No blob with this digest.
    #[error("blob unknown: {0}")]
    NotFound(Digest),

    /// The repository has never been pushed to.
    #[error("repository unknown: {0}")]
    NameUnknown(RepositoryName),

    /// The repository exists but the reference does not.
    #[error("manifest unknown: {repository}:{reference}")]
    ManifestUnknown {
        /// Repository searched.
        repository: RepositoryName,
        /// Reference that was not found.
        reference: Reference,
    },

    /// No upload session with this id in the repository.
    #[error("upload session unknown: {0}")]
    UploadUnknown(SessionId),

    /// A chunk did not start where the session left off.
    #[error("chunk at offset {offset} does not continue an upload of {expected} bytes")]
    BadUpload {
        /// Bytes committed to the session so far.
        expected: u64,
        /// Offset the chunk claimed to start at.
        offset: u64,
    },

    /// The upload has more parts than the backend can list.
    #[error("unsupported upload size: {0}")]
    UploadTooLarge(String),

    /// Too many uploads are in progress to find the session.
    #[error("too many concurrent uploads, retry later")]
    TooManyUploads,

    /// Content does not hash to the declared digest.
    #[error("digest mismatch: expected {expected}, computed {computed} over {read} bytes")]
    DigestMismatch {
        /// Declared digest.
        expected: Digest,
        /// Digest of the content received.
        computed: Digest,
        /// Bytes received.
        read: u64,
    },

    /// Content length does not match the declared size.
    #[error("size mismatch: expected {expected} bytes, read {read}")]
    SizeMismatch {
        /// Declared size.
        expected: u64,
        /// Bytes received.
        read: u64,
    },

    /// A reference already points at different content.
    #[error("{reference} already references {existing}")]
    TagConflict {
        /// Reference being written.
        reference: String,
        /// Digest and content type it currently holds.
        existing: String,
    },

    /// The backend does not provide this operation.
    #[error("{0} is not supported")]
    Unsupported(&'static str),

    /// Metadata persistence failed.
    #[error("metadata store error")]
    Metadata(#[from] MetadataError),

    /// Object storage failed.
    #[error("object storage error")]
    Storage(#[source] StorageError),

    /// Local I/O failed.
    #[error("I/O error")]
    Io(#[source] io::Error),
}

impl From<VerifyError> for StoreError {
    fn from(error: VerifyError) -> Self {
        match error {
            VerifyError::SizeMismatch { expected, read } => {
                StoreError::SizeMismatch { expected, read }
            }
            VerifyError::DigestMismatch {
                expected,
                computed,
                read,
            } => StoreError::DigestMismatch {
                expected,
                computed,
                read,
            },
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(error: io::Error) -> Self {
        match VerifyError::find(&error) {
            Some(verify) => verify.into(),
            None => StoreError::Io(error),
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(error: StorageError) -> Self {
        match VerifyError::find(&error) {
            Some(verify) => verify.into(),
            None => StoreError::Storage(error),
        }
    }
}
