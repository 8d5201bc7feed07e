//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::store::StoreError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Repository not known to the registry
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// Upload session not found
    #[error("blob upload unknown: {0}")]
    UploadUnknown(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Content length did not match the declared size
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Declared size
        expected: u64,
        /// Bytes received
        actual: u64,
    },

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Tag already points at different content
    #[error("tag {reference} already references {existing}")]
    TagConflict {
        /// The tag being pushed
        reference: String,
        /// What the tag currently holds
        existing: String,
    },

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Manifest body exceeds the configured limit
    #[error("manifest exceeds {0} bytes")]
    ManifestTooLarge(usize),

    /// Range not satisfiable
    #[error("range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Chunk did not continue the upload where it left off
    #[error("blob upload out of range: {0}")]
    UploadOutOfRange(String),

    /// Too many concurrent operations, retry later
    #[error("too many requests: {0}")]
    TooManyRequests(String),

    /// Access denied by the authorizer
    #[error("access denied: {0}")]
    Denied(String),

    /// Operation is not supported by this registry
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Endpoint does not exist or is disabled
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Malformed query parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Backend failure
    #[error("storage backend error")]
    Backend(#[source] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::NameUnknown(_)
            | RegistryError::UploadUnknown(_)
            | RegistryError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::SizeMismatch { .. }
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::TagConflict { .. }
            | RegistryError::InvalidManifest(_)
            | RegistryError::UnsupportedManifestType(_)
            | RegistryError::ManifestTooLarge(_)
            | RegistryError::BlobUploadInvalid(_)
            | RegistryError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            RegistryError::RangeNotSatisfiable(_) | RegistryError::UploadOutOfRange(_) => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            RegistryError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            RegistryError::Denied(_) => StatusCode::FORBIDDEN,
            RegistryError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Backend(_) | RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::NameUnknown(_) => "NAME_UNKNOWN",
            RegistryError::UploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::InvalidDigest(_) => "DIGEST_INVALID",
            RegistryError::DigestMismatch { .. } => "DIGEST_INVALID",
            RegistryError::SizeMismatch { .. } => "SIZE_INVALID",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) | RegistryError::TagConflict { .. } => "TAG_INVALID",
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::UnsupportedManifestType(_) => "MANIFEST_INVALID",
            RegistryError::ManifestTooLarge(_) => "SIZE_INVALID",
            RegistryError::RangeNotSatisfiable(_) => "RANGE_INVALID",
            RegistryError::BlobUploadInvalid(_) | RegistryError::UploadOutOfRange(_) => {
                "BLOB_UPLOAD_INVALID"
            }
            RegistryError::TooManyRequests(_) => "TOOMANYREQUESTS",
            RegistryError::Denied(_) => "DENIED",
            RegistryError::Unsupported(_)
            | RegistryError::UnknownEndpoint(_)
            | RegistryError::InvalidParameter(_) => "UNSUPPORTED",
            RegistryError::Backend(_) | RegistryError::Io(_) => "UNKNOWN",
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(digest) => RegistryError::BlobNotFound(digest.to_string()),
            StoreError::NameUnknown(name) => RegistryError::NameUnknown(name.to_string()),
            StoreError::ManifestUnknown {
                repository,
                reference,
            } => RegistryError::ManifestNotFound(format!("{repository}:{reference}")),
            StoreError::UploadUnknown(session) => RegistryError::UploadUnknown(session.to_string()),
            StoreError::BadUpload { expected, offset } => RegistryError::UploadOutOfRange(format!(
                "chunk starts at {offset}, upload has {expected} bytes"
            )),
            StoreError::UploadTooLarge(detail) => RegistryError::BlobUploadInvalid(detail),
            StoreError::TooManyUploads => {
                RegistryError::TooManyRequests("too many concurrent uploads, retry later".into())
            }
            StoreError::DigestMismatch {
                expected, computed, ..
            } => RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: computed.to_string(),
            },
            StoreError::SizeMismatch { expected, read } => RegistryError::SizeMismatch {
                expected,
                actual: read,
            },
            StoreError::TagConflict {
                reference,
                existing,
            } => RegistryError::TagConflict {
                reference,
                existing,
            },
            StoreError::Unsupported(operation) => RegistryError::Unsupported(operation.into()),
            error => RegistryError::Backend(error),
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        let message = if status.is_server_error() {
            tracing::error!(error = ?self, "registry request failed");
            "internal server error".to_string()
        } else {
            tracing::debug!(%code, error = %self, "registry request rejected");
            self.to_string()
        };

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    #[test]
    fn store_errors_classify() {
        let digest = Digest::sha256(b"x");
        let err: RegistryError = StoreError::NotFound(digest).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), "BLOB_UNKNOWN");

        let err: RegistryError = StoreError::BadUpload {
            expected: 4,
            offset: 0,
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::RANGE_NOT_SATISFIABLE);

        let err: RegistryError = StoreError::TooManyUploads.into();
        assert_eq!(err.error_code(), "TOOMANYREQUESTS");
    }

    #[tokio::test]
    async fn internal_errors_hide_detail() {
        let err = RegistryError::Io(std::io::Error::other("disk on fire"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["errors"][0]["code"], "UNKNOWN");
        assert_eq!(body["errors"][0]["message"], "internal server error");
    }
}
