//! Registry-specific headers and byte range handling.

use axum::http::header::HeaderName;
use axum::http::HeaderMap;

use crate::error::{RegistryError, RegistryResult};

/// Digest of the content in the response.
pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

/// Identifier of an upload session.
pub const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// Protocol version announced on every response.
pub const DOCKER_DISTRIBUTION_API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");

/// Subject of a pushed manifest.
pub const OCI_SUBJECT: HeaderName = HeaderName::from_static("oci-subject");

/// Filters applied to a referrers listing.
pub const OCI_FILTERS_APPLIED: HeaderName = HeaderName::from_static("oci-filters-applied");

/// An inclusive byte range within content of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for content of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{size}", self.start, self.end)
    }

    /// Parse a `Range` header against content of `size` bytes.
    ///
    /// Accepts a single `bytes=a-b`, `bytes=a-` or `bytes=-n` range.
    pub fn parse(value: &str, size: u64) -> RegistryResult<Self> {
        let invalid = || RegistryError::RangeNotSatisfiable(value.to_string());

        let ranges = value.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
        if ranges.contains(',') {
            return Err(invalid());
        }
        let (first, last) = ranges.split_once('-').ok_or_else(invalid)?;
        let number = |s: &str| s.trim().parse::<u64>().map_err(|_| invalid());

        let (start, end) = match (first.trim().is_empty(), last.trim().is_empty()) {
            (true, true) => return Err(invalid()),
            (true, false) => {
                let suffix = number(last)?;
                if suffix == 0 || size == 0 {
                    return Err(invalid());
                }
                (size.saturating_sub(suffix), size - 1)
            }
            (false, true) => (number(first)?, size.saturating_sub(1)),
            (false, false) => {
                let (start, end) = (number(first)?, number(last)?);
                if end < start {
                    return Err(invalid());
                }
                (start, end.min(size.saturating_sub(1)))
            }
        };

        if start >= size {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

/// `Range` value describing `size` committed upload bytes.
pub fn upload_range(size: u64) -> String {
    format!("0-{}", size.saturating_sub(1))
}

/// Parse an upload `Content-Range` of the form `start-end`, returning both offsets.
pub fn parse_content_range(value: &str) -> RegistryResult<(u64, u64)> {
    let invalid = || RegistryError::UploadOutOfRange(format!("malformed Content-Range: {value}"));

    let value = value.trim();
    let value = value.strip_prefix("bytes ").unwrap_or(value);
    let range = value.split('/').next().unwrap_or_default();
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    Ok((start, end))
}

/// A header value as a string, if present and printable.
pub fn header_str<'h>(headers: &'h HeaderMap, name: &HeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// The declared `Content-Length`, if present and numeric.
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, &axum::http::header::CONTENT_LENGTH)?
        .trim()
        .parse()
        .ok()
}
