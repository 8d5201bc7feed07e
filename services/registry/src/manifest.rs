//! Manifest operations for the registry

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{AppendHeaders, IntoResponse, Response};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::access::{AccessRequest, Action, PullEvent};
use crate::api::{Registry, query};
use crate::digest::{Algorithm, Digest};
use crate::document::{
    Descriptor, ImageIndex, ImageManifest, ManifestKind, OCI_INDEX, ReferrerFields,
};
use crate::error::{RegistryError, RegistryResult};
use crate::headers::{
    DOCKER_CONTENT_DIGEST, OCI_FILTERS_APPLIED, OCI_SUBJECT, content_length, header_str,
};
use crate::name::{Reference, RepositoryName};
use crate::store::{Located, Manifest, StoreError};
use crate::verify::DigestVerifier;

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    n: Option<usize>,
    last: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReferrersQuery {
    artifact_type: Option<String>,
}

/// Tag listing response
#[derive(Debug, Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

/// Catalog response
#[derive(Debug, Serialize)]
pub(crate) struct Catalog {
    repositories: Vec<String>,
}

/// The only field read from a manifest pushed without a `Content-Type`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeField {
    media_type: Option<String>,
}

fn parse_document<T: DeserializeOwned>(bytes: &[u8]) -> RegistryResult<T> {
    serde_json::from_slice(bytes).map_err(|error| RegistryError::InvalidManifest(error.to_string()))
}

/// Get a manifest, or only its headers for `HEAD`.
pub(crate) async fn get(
    registry: &Registry,
    repository: RepositoryName,
    reference: &str,
    parts: &Parts,
    head: bool,
) -> RegistryResult<Response> {
    let reference = Reference::parse(reference)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Pull, &repository).with_reference(reference.clone()),
            &parts.headers,
        )
        .await?;

    let manifest = registry.manifests().get(&repository, &reference).await?;
    let headers = [
        (header::CONTENT_TYPE, manifest.content_type.clone()),
        (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
    ];

    if head {
        return Ok((
            StatusCode::OK,
            headers,
            [(header::CONTENT_LENGTH, manifest.size.to_string())],
        )
            .into_response());
    }

    let bytes = manifest_bytes(registry, &repository, &manifest).await?;
    registry
        .pulled(PullEvent::Manifest {
            repository,
            reference,
            digest: manifest.digest,
        })
        .await;
    Ok((StatusCode::OK, headers, bytes).into_response())
}

/// Read the bytes of a stored manifest.
async fn manifest_bytes(
    registry: &Registry,
    repository: &RepositoryName,
    manifest: &Manifest,
) -> RegistryResult<Bytes> {
    if let Some(raw) = &manifest.raw {
        return Ok(raw.clone());
    }

    match registry
        .blobs()
        .reader()
        .get(repository, &manifest.digest, false)
        .await?
    {
        Located::Here(blob) => {
            let mut reader = DigestVerifier::new(blob.reader, manifest.digest.clone(), manifest.size);
            let mut buffer = Vec::new();
            reader.read_to_end(&mut buffer).await?;
            Ok(buffer.into())
        }
        Located::Redirect(_) => Err(RegistryError::Backend(StoreError::Unsupported(
            "redirected manifest read",
        ))),
    }
}

/// Push a manifest under a tag or digest.
pub(crate) async fn put(
    registry: &Registry,
    repository: RepositoryName,
    reference: &str,
    parts: &Parts,
    body: Body,
) -> RegistryResult<Response> {
    let reference = Reference::parse(reference)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Push, &repository).with_reference(reference.clone()),
            &parts.headers,
        )
        .await?;
    registry.require_writable()?;

    let limit = registry.max_manifest_size();
    if content_length(&parts.headers).is_some_and(|length| length > limit as u64) {
        return Err(RegistryError::ManifestTooLarge(limit));
    }
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| RegistryError::ManifestTooLarge(limit))?;

    let content_type = match header_str(&parts.headers, &header::CONTENT_TYPE) {
        Some(content_type) => content_type.to_string(),
        None => parse_document::<MediaTypeField>(&bytes)?
            .media_type
            .ok_or_else(|| RegistryError::InvalidManifest("no media type given".into()))?,
    };
    let kind = ManifestKind::from_media_type(&content_type)
        .ok_or_else(|| RegistryError::UnsupportedManifestType(content_type.clone()))?;

    let algorithm = reference
        .as_digest()
        .map(Digest::algorithm)
        .unwrap_or(Algorithm::Sha256);
    let digest = Digest::compute(algorithm, &bytes);
    if let Some(expected) = reference.as_digest() {
        if *expected != digest {
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: digest.to_string(),
            });
        }
    }

    let (blobs, subject) = match kind {
        ManifestKind::Image => {
            let image: ImageManifest = parse_document(&bytes)?;
            (image.blobs(), image.subject)
        }
        ManifestKind::Index => {
            let index: ImageIndex = parse_document(&bytes)?;
            require_children(registry, &repository, &index).await?;
            let children = index
                .manifests
                .iter()
                .map(|child| child.digest.clone())
                .collect();
            (children, index.subject)
        }
    };

    let size = bytes.len() as u64;
    let mut reader = DigestVerifier::new(&bytes[..], digest.clone(), size);
    registry
        .blobs()
        .writer()?
        .put(&repository, &digest, Some(&content_type), &mut reader)
        .await?;

    let manifest = Manifest {
        digest: digest.clone(),
        content_type,
        size,
        raw: (kind == ManifestKind::Index).then(|| bytes.clone()),
    };

    let mut transaction = registry.manifests().begin().await?;
    transaction
        .put(&repository, &Reference::Digest(digest.clone()), &manifest, &blobs)
        .await?;
    if let Reference::Tag(_) = &reference {
        transaction
            .put(&repository, &reference, &manifest, &blobs)
            .await?;
    }
    transaction.commit().await?;
    tracing::info!(%repository, %reference, %digest, "manifest pushed");

    let subject = subject.map(|subject| (OCI_SUBJECT, subject.digest.to_string()));
    Ok((
        StatusCode::CREATED,
        [
            (
                header::LOCATION,
                format!("/v2/{repository}/manifests/{digest}"),
            ),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
        AppendHeaders(subject),
    )
        .into_response())
}

/// Every child an index lists must already be stored in the repository.
async fn require_children(
    registry: &Registry,
    repository: &RepositoryName,
    index: &ImageIndex,
) -> RegistryResult<()> {
    for child in index.manifests.iter().filter(|child| child.is_distributable()) {
        match registry
            .manifests()
            .get(repository, &Reference::Digest(child.digest.clone()))
            .await
        {
            Ok(_) => {}
            Err(StoreError::ManifestUnknown { .. } | StoreError::NameUnknown(_)) => {
                return Err(RegistryError::ManifestNotFound(format!(
                    "{repository}@{} listed by index",
                    child.digest
                )));
            }
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}

/// Delete a manifest
pub(crate) async fn delete(
    registry: &Registry,
    repository: RepositoryName,
    reference: &str,
    parts: &Parts,
) -> RegistryResult<Response> {
    let reference = Reference::parse(reference)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Delete, &repository).with_reference(reference.clone()),
            &parts.headers,
        )
        .await?;
    registry.require_writable()?;

    registry.manifests().delete(&repository, &reference).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// List tags
pub(crate) async fn tags(
    registry: &Registry,
    repository: RepositoryName,
    parts: &Parts,
) -> RegistryResult<Response> {
    let params: ListQuery = query(&parts.uri)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Pull, &repository),
            &parts.headers,
        )
        .await?;

    let tags = registry
        .manifests()
        .tags(&repository, params.n, params.last.as_deref())
        .await?;

    let next = match (params.n, tags.last()) {
        (Some(n), Some(last)) if tags.len() == n => Some((
            header::LINK,
            format!("</v2/{repository}/tags/list?n={n}&last={last}>; rel=\"next\""),
        )),
        _ => None,
    };

    Ok((
        AppendHeaders(next),
        Json(TagList {
            name: repository.to_string(),
            tags,
        }),
    )
        .into_response())
}

/// List repositories
pub(crate) async fn catalog(
    State(registry): State<Registry>,
    uri: Uri,
    headers: HeaderMap,
) -> RegistryResult<Json<Catalog>> {
    let params: ListQuery = query(&uri)?;
    registry.authorize(AccessRequest::catalog(), &headers).await?;

    let repositories = registry.manifests().repositories(params.n).await?;
    Ok(Json(Catalog {
        repositories: repositories.iter().map(ToString::to_string).collect(),
    }))
}

/// List manifests whose subject is `digest`.
pub(crate) async fn referrers(
    registry: &Registry,
    repository: RepositoryName,
    digest: &str,
    parts: &Parts,
) -> RegistryResult<Response> {
    if !registry.referrers_enabled() {
        return Err(RegistryError::UnknownEndpoint(
            "referrers API is disabled".into(),
        ));
    }

    let subject = Digest::parse(digest)?;
    let params: ReferrersQuery = query(&parts.uri)?;
    registry
        .authorize(
            AccessRequest::repository(Action::Pull, &repository).with_reference(subject.clone()),
            &parts.headers,
        )
        .await?;

    let candidates = match registry.manifests().digests(&repository).await {
        Ok(digests) => digests,
        Err(StoreError::NameUnknown(_)) => Vec::new(),
        Err(error) => return Err(error.into()),
    };

    let mut descriptors = Vec::new();
    for candidate in candidates {
        let manifest = registry
            .manifests()
            .get(&repository, &Reference::Digest(candidate))
            .await?;
        let bytes = manifest_bytes(registry, &repository, &manifest).await?;
        let Ok(fields) = serde_json::from_slice::<ReferrerFields>(&bytes) else {
            tracing::debug!(%repository, digest = %manifest.digest, "skipping unreadable manifest");
            continue;
        };
        if !fields.refers_to(&subject) {
            continue;
        }

        let artifact_type = fields.effective_artifact_type();
        if let Some(wanted) = &params.artifact_type {
            if artifact_type.as_deref() != Some(wanted.as_str()) {
                continue;
            }
        }

        descriptors.push(Descriptor {
            media_type: manifest.content_type,
            digest: manifest.digest,
            size: manifest.size,
            urls: Vec::new(),
            artifact_type,
            annotations: fields.annotations,
        });
    }

    let filters = params
        .artifact_type
        .as_ref()
        .map(|_| (OCI_FILTERS_APPLIED, "artifactType"));
    Ok((
        [(header::CONTENT_TYPE, OCI_INDEX)],
        AppendHeaders(filters),
        Json(ImageIndex::new(descriptors)),
    )
        .into_response())
}
