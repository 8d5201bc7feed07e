//! Blob operations for the registry

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{AppendHeaders, IntoResponse, Response};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, sink};
use tokio_util::io::ReaderStream;

use crate::access::{AccessRequest, Action, PullEvent};
use crate::api::{Registry, body_reader, query};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::headers::{
    ByteRange, DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, content_length, header_str,
    parse_content_range, upload_range,
};
use crate::name::{RepositoryName, SessionId};
use crate::store::{BlobUploads, Located, Redirect, StoreError};
use crate::verify::{DigestVerifier, LengthVerifier, UNKNOWN_SIZE};

#[derive(Debug, Default, Deserialize)]
struct StartQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FinishQuery {
    digest: Option<String>,
}

fn parse_session(session: &str) -> RegistryResult<SessionId> {
    session
        .parse()
        .map_err(|_| RegistryError::UploadUnknown(session.to_string()))
}

/// Get a blob, or report on an upload session addressed through the blob path.
pub(crate) async fn get(
    registry: &Registry,
    repository: RepositoryName,
    target: &str,
    parts: &Parts,
) -> RegistryResult<Response> {
    if target.parse::<SessionId>().is_ok() {
        return session_status(registry, repository, target, parts).await;
    }

    let digest = Digest::parse(target)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Pull, &repository).with_reference(digest.clone()),
            &parts.headers,
        )
        .await?;

    let blob = match registry.blobs().reader().get(&repository, &digest, true).await? {
        Located::Here(blob) => blob,
        Located::Redirect(redirect) => {
            registry.pulled(PullEvent::Blob { repository, digest }).await;
            return Ok(redirect_response(redirect));
        }
    };

    let size = match (blob.size, registry.blobs().stat()) {
        (Some(size), _) => Some(size),
        (None, Some(stat)) => match stat.stat(&repository, &digest).await? {
            Located::Here(size) => Some(size),
            Located::Redirect(_) => None,
        },
        (None, None) => None,
    };

    let mut reader = blob.reader;
    let common = [
        (header::CONTENT_TYPE, mime::APPLICATION_OCTET_STREAM.to_string()),
        (DOCKER_CONTENT_DIGEST, digest.to_string()),
        (header::ACCEPT_RANGES, "bytes".to_string()),
    ];

    let response = match (header_str(&parts.headers, &header::RANGE), size) {
        (Some(range), Some(size)) => {
            let range = ByteRange::parse(range, size)?;
            tokio::io::copy(&mut (&mut reader).take(range.start), &mut sink()).await?;
            let body = Body::from_stream(ReaderStream::new(reader.take(range.len())));
            (
                StatusCode::PARTIAL_CONTENT,
                common,
                [
                    (header::CONTENT_RANGE, range.content_range(size)),
                    (header::CONTENT_LENGTH, range.len().to_string()),
                ],
                body,
            )
                .into_response()
        }
        (_, size) => {
            let length = size.map(|size| (header::CONTENT_LENGTH, size.to_string()));
            let body = Body::from_stream(ReaderStream::new(reader));
            (StatusCode::OK, common, AppendHeaders(length), body).into_response()
        }
    };

    registry.pulled(PullEvent::Blob { repository, digest }).await;
    Ok(response)
}

/// Check if a blob exists
pub(crate) async fn head(
    registry: &Registry,
    repository: RepositoryName,
    target: &str,
    parts: &Parts,
) -> RegistryResult<Response> {
    let digest = Digest::parse(target)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Pull, &repository).with_reference(digest.clone()),
            &parts.headers,
        )
        .await?;

    let size = match registry.blobs().stat() {
        Some(stat) => match stat.stat(&repository, &digest).await? {
            Located::Here(size) => size,
            Located::Redirect(redirect) => return Ok(redirect_response(redirect)),
        },
        // Without stat support the size is found by reading the blob.
        None => match registry.blobs().reader().get(&repository, &digest, false).await? {
            Located::Here(blob) => match blob.size {
                Some(size) => size,
                None => {
                    let mut reader = blob.reader;
                    tokio::io::copy(&mut reader, &mut sink()).await?
                }
            },
            Located::Redirect(redirect) => return Ok(redirect_response(redirect)),
        },
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime::APPLICATION_OCTET_STREAM.to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

/// Delete a blob
pub(crate) async fn delete(
    registry: &Registry,
    repository: RepositoryName,
    target: &str,
    parts: &Parts,
) -> RegistryResult<Response> {
    let digest = Digest::parse(target)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Delete, &repository).with_reference(digest.clone()),
            &parts.headers,
        )
        .await?;
    registry.require_writable()?;

    registry
        .blobs()
        .deleter()?
        .delete(&repository, &digest)
        .await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Start a blob upload, push a whole blob, or mount one from another repository.
pub(crate) async fn start(
    registry: &Registry,
    repository: RepositoryName,
    parts: &Parts,
    body: Body,
) -> RegistryResult<Response> {
    let params: StartQuery = query(&parts.uri)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Push, &repository),
            &parts.headers,
        )
        .await?;
    registry.require_writable()?;

    if let (Some(mount), Some(from)) = (&params.mount, &params.from) {
        let digest = Digest::parse(mount)?;
        let from: RepositoryName = from.parse()?;
        registry
            .authorize(
                AccessRequest::repository(Action::Pull, &from).with_reference(digest.clone()),
                &parts.headers,
            )
            .await?;
        if exists(registry, &from, &digest).await? {
            tracing::debug!(%repository, %from, %digest, "mounted blob");
            return Ok(created(&repository, &digest));
        }
        tracing::debug!(%repository, %from, %digest, "mount source missing, starting upload");
    } else if let Some(digest) = &params.digest {
        let digest = Digest::parse(digest)?;
        let size = content_length(&parts.headers).unwrap_or(UNKNOWN_SIZE);
        let mut reader = DigestVerifier::new(body_reader(body), digest.clone(), size);
        registry
            .blobs()
            .writer()?
            .put(
                &repository,
                &digest,
                header_str(&parts.headers, &header::CONTENT_TYPE),
                &mut reader,
            )
            .await?;
        tracing::debug!(%repository, %digest, bytes = reader.bytes_read(), "pushed blob");
        return Ok(created(&repository, &digest));
    }

    let session = registry.blobs().uploads()?.start_session(&repository).await?;
    tracing::debug!(%repository, %session, "started upload");
    Ok(upload_status(StatusCode::ACCEPTED, &repository, session, 0))
}

/// Report how much of an upload has been committed.
pub(crate) async fn session_status(
    registry: &Registry,
    repository: RepositoryName,
    session: &str,
    parts: &Parts,
) -> RegistryResult<Response> {
    let session = parse_session(session)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Push, &repository),
            &parts.headers,
        )
        .await?;

    let size = registry
        .blobs()
        .uploads()?
        .uploaded_size(&repository, session)
        .await?;
    Ok(upload_status(StatusCode::NO_CONTENT, &repository, session, size))
}

/// Append a chunk to an upload.
pub(crate) async fn patch(
    registry: &Registry,
    repository: RepositoryName,
    session: &str,
    parts: &Parts,
    body: Body,
) -> RegistryResult<Response> {
    let session = parse_session(session)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Push, &repository),
            &parts.headers,
        )
        .await?;
    registry.require_writable()?;

    let range = chunk_range(parts)?;
    let offset = range.map_or(0, |(start, _)| start);
    let uploads = registry.blobs().uploads()?;
    let size = append_chunk(uploads, &repository, session, offset, range, body).await?;
    Ok(upload_status(StatusCode::ACCEPTED, &repository, session, size))
}

/// Complete an upload, optionally appending a final chunk first.
pub(crate) async fn finish(
    registry: &Registry,
    repository: RepositoryName,
    session: &str,
    parts: &Parts,
    body: Body,
) -> RegistryResult<Response> {
    let session = parse_session(session)?;
    let params: FinishQuery = query(&parts.uri)?;
    let digest = params
        .digest
        .ok_or_else(|| RegistryError::InvalidDigest("missing digest parameter".into()))?;
    let digest = Digest::parse(&digest)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Push, &repository).with_reference(digest.clone()),
            &parts.headers,
        )
        .await?;
    registry.require_writable()?;

    let uploads = registry.blobs().uploads()?;
    let range = chunk_range(parts)?;

    if range.is_some() || content_length(&parts.headers) != Some(0) {
        let offset = match range {
            Some((start, _)) => start,
            None => uploads.uploaded_size(&repository, session).await?,
        };
        append_chunk(uploads, &repository, session, offset, range, body).await?;
    }

    uploads.complete(&repository, session, &digest).await?;
    tracing::debug!(%repository, %session, %digest, "completed upload");
    Ok(created(&repository, &digest))
}

/// The range a chunk declares in `Content-Range`, checked against `Content-Length`.
fn chunk_range(parts: &Parts) -> RegistryResult<Option<(u64, u64)>> {
    let Some(value) = header_str(&parts.headers, &header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let (start, end) = parse_content_range(value)?;
    let declared = (end - start).saturating_add(1);
    match content_length(&parts.headers) {
        Some(length) if length != declared => Err(RegistryError::UploadOutOfRange(format!(
            "Content-Range {start}-{end} does not match Content-Length {length}"
        ))),
        _ => Ok(Some((start, end))),
    }
}

/// Append a chunk to a session.
///
/// With a declared range the body must be exactly that long; the stores read the
/// whole chunk before committing it, so a short or long body leaves the session as
/// it was.
async fn append_chunk(
    uploads: &dyn BlobUploads,
    repository: &RepositoryName,
    session: SessionId,
    offset: u64,
    range: Option<(u64, u64)>,
    body: Body,
) -> RegistryResult<u64> {
    let size = range.map_or(UNKNOWN_SIZE, |(start, end)| (end - start).saturating_add(1));
    let mut reader = LengthVerifier::new(body_reader(body), size);
    uploads
        .put_chunk(repository, session, &mut reader, offset)
        .await
        .map_err(|error| match error {
            StoreError::SizeMismatch { expected, read } => RegistryError::UploadOutOfRange(
                format!("chunk declared {expected} bytes but sent {read}"),
            ),
            error => error.into(),
        })
}

async fn exists(
    registry: &Registry,
    repository: &RepositoryName,
    digest: &Digest,
) -> RegistryResult<bool> {
    let found = match registry.blobs().stat() {
        Some(stat) => stat.stat(repository, digest).await.map(|_| ()),
        None => registry
            .blobs()
            .reader()
            .get(repository, digest, true)
            .await
            .map(|_| ()),
    };
    match found {
        Ok(()) => Ok(true),
        Err(StoreError::NotFound(_)) => Ok(false),
        Err(error) => Err(error.into()),
    }
}

fn created(repository: &RepositoryName, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (
                header::LOCATION,
                format!("/v2/{repository}/blobs/{digest}"),
            ),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

fn upload_status(
    status: StatusCode,
    repository: &RepositoryName,
    session: SessionId,
    size: u64,
) -> Response {
    let headers: [(HeaderName, String); 4] = [
        (
            header::LOCATION,
            format!("/v2/{repository}/blobs/uploads/{session}"),
        ),
        (header::RANGE, upload_range(size)),
        (DOCKER_UPLOAD_UUID, session.to_string()),
        (header::CONTENT_LENGTH, "0".to_string()),
    ];
    (status, headers).into_response()
}

pub(crate) fn redirect_response(redirect: Redirect) -> Response {
    (redirect.status, [(header::LOCATION, redirect.location)]).into_response()
}
