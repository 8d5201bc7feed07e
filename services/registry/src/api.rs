//! API server builder and router

use std::io;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{Json, Response};
use axum::routing::get;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tower::ServiceBuilder;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::access::{AccessRequest, AllowAll, AuditSink, Authorizer, PullEvent, TracingAudit};
use crate::error::{RegistryError, RegistryResult};
use crate::headers::{DOCKER_DISTRIBUTION_API_VERSION, header_str};
use crate::route::Route;
use crate::store::{BlobStore, ManifestStore, MemoryBlobStore, MemoryManifestStore};
use crate::{blob, manifest};

/// Default limit on manifest bodies.
pub const DEFAULT_MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// Errors wiring up a registry.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A writable registry needs a blob store which accepts pushes.
    #[error("blob store lacks the {0} capability needed to accept pushes")]
    MissingCapability(&'static str),
}

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    blobs: Option<BlobStore>,
    manifests: Option<Arc<dyn ManifestStore>>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
    referrers: bool,
    max_manifest_size: usize,
    read_only: bool,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    ///
    /// Without further configuration the registry keeps everything in memory and
    /// allows every request.
    pub fn new() -> Self {
        Self {
            blobs: None,
            manifests: None,
            authorizer: Arc::new(AllowAll),
            audit: Arc::new(TracingAudit),
            referrers: true,
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
            read_only: false,
        }
    }

    /// Set the blob store
    pub fn blobs(mut self, blobs: BlobStore) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Set the manifest store
    pub fn manifests<M: ManifestStore + 'static>(mut self, manifests: M) -> Self {
        self.manifests = Some(Arc::new(manifests));
        self
    }

    /// Set the authorizer consulted before every operation
    pub fn authorizer<A: Authorizer + 'static>(mut self, authorizer: A) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Set the sink notified of successful pulls
    pub fn audit<S: AuditSink + 'static>(mut self, audit: S) -> Self {
        self.audit = Arc::new(audit);
        self
    }

    /// Enable or disable the referrers API
    pub fn referrers(mut self, enabled: bool) -> Self {
        self.referrers = enabled;
        self
    }

    /// Limit the size of pushed manifests
    pub fn max_manifest_size(mut self, bytes: usize) -> Self {
        self.max_manifest_size = bytes;
        self
    }

    /// Refuse every push and delete
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Result<Router, BuildError> {
        let blobs = self
            .blobs
            .unwrap_or_else(|| BlobStore::full(Arc::new(MemoryBlobStore::new())));
        let manifests = self
            .manifests
            .unwrap_or_else(|| Arc::new(MemoryManifestStore::new()));

        if !self.read_only {
            let capabilities = blobs.capabilities();
            if !capabilities.put {
                return Err(BuildError::MissingCapability("put"));
            }
            if !capabilities.uploads {
                return Err(BuildError::MissingCapability("uploads"));
            }
        }

        tracing::debug!(
            capabilities = ?blobs.capabilities(),
            referrers = self.referrers,
            read_only = self.read_only,
            "building registry"
        );

        let registry = Registry {
            inner: Arc::new(RegistryInner {
                blobs,
                manifests,
                authorizer: self.authorizer,
                audit: self.audit,
                referrers: self.referrers,
                max_manifest_size: self.max_manifest_size,
                read_only: self.read_only,
            }),
        };

        Ok(Router::new()
            .route("/v2", get(api_version_check))
            .route("/v2/", get(api_version_check))
            .route("/v2/_catalog", get(manifest::catalog))
            .route("/_catalog", get(manifest::catalog))
            .fallback(dispatch)
            .with_state(registry)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(SetResponseHeaderLayer::overriding(
                        DOCKER_DISTRIBUTION_API_VERSION,
                        HeaderValue::from_static("registry/2.0"),
                    )),
            ))
    }
}

/// Shared state of a running registry.
#[derive(Debug, Clone)]
pub(crate) struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    blobs: BlobStore,
    manifests: Arc<dyn ManifestStore>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
    referrers: bool,
    max_manifest_size: usize,
    read_only: bool,
}

impl Registry {
    pub(crate) fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub(crate) fn manifests(&self) -> &dyn ManifestStore {
        self.inner.manifests.as_ref()
    }

    pub(crate) fn referrers_enabled(&self) -> bool {
        self.inner.referrers
    }

    pub(crate) fn max_manifest_size(&self) -> usize {
        self.inner.max_manifest_size
    }

    /// Ask the authorizer, passing along the caller's credentials.
    pub(crate) async fn authorize(
        &self,
        request: AccessRequest,
        headers: &HeaderMap,
    ) -> RegistryResult<()> {
        let credentials = header_str(headers, &header::AUTHORIZATION).map(str::to_owned);
        let request = request.with_credentials(credentials);
        self.inner
            .authorizer
            .authorize(&request)
            .await
            .map_err(|denied| {
                tracing::debug!(%request, %denied, "access denied");
                RegistryError::Denied(denied.to_string())
            })
    }

    /// Fail mutating requests on a read-only registry.
    pub(crate) fn require_writable(&self) -> RegistryResult<()> {
        if self.inner.read_only {
            return Err(RegistryError::Unsupported("registry is read-only".into()));
        }
        Ok(())
    }

    pub(crate) async fn pulled(&self, event: PullEvent) {
        self.inner.audit.pulled(&event).await;
    }
}

/// Stream a request body.
pub(crate) fn body_reader(body: Body) -> impl AsyncRead + Unpin + Send + 'static {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

/// Decode the query string.
pub(crate) fn query<T: DeserializeOwned>(uri: &Uri) -> RegistryResult<T> {
    serde_urlencoded::from_str(uri.query().unwrap_or_default())
        .map_err(|error| RegistryError::InvalidParameter(error.to_string()))
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

/// Route every repository-scoped request.
async fn dispatch(State(registry): State<Registry>, request: Request) -> RegistryResult<Response> {
    let route = Route::classify(request.uri().path())?;
    let (parts, body) = request.into_parts();

    match (&parts.method, route) {
        (&Method::GET, Route::Blob { repository, target }) => {
            blob::get(&registry, repository, &target, &parts).await
        }
        (&Method::HEAD, Route::Blob { repository, target }) => {
            blob::head(&registry, repository, &target, &parts).await
        }
        (&Method::DELETE, Route::Blob { repository, target }) => {
            blob::delete(&registry, repository, &target, &parts).await
        }
        (&Method::POST, Route::Uploads { repository }) => {
            blob::start(&registry, repository, &parts, body).await
        }
        (&Method::GET, Route::Upload { repository, session }) => {
            blob::session_status(&registry, repository, &session, &parts).await
        }
        (&Method::PATCH, Route::Upload { repository, session }) => {
            blob::patch(&registry, repository, &session, &parts, body).await
        }
        (&Method::PUT, Route::Upload { repository, session }) => {
            blob::finish(&registry, repository, &session, &parts, body).await
        }
        (&Method::GET, Route::Manifest { repository, reference }) => {
            manifest::get(&registry, repository, &reference, &parts, false).await
        }
        (&Method::HEAD, Route::Manifest { repository, reference }) => {
            manifest::get(&registry, repository, &reference, &parts, true).await
        }
        (&Method::PUT, Route::Manifest { repository, reference }) => {
            manifest::put(&registry, repository, &reference, &parts, body).await
        }
        (&Method::DELETE, Route::Manifest { repository, reference }) => {
            manifest::delete(&registry, repository, &reference, &parts).await
        }
        (&Method::GET, Route::Tags { repository }) => {
            manifest::tags(&registry, repository, &parts).await
        }
        (&Method::GET, Route::Referrers { repository, digest }) => {
            manifest::referrers(&registry, repository, &digest, &parts).await
        }
        (method, _) => Err(RegistryError::Unsupported(format!(
            "{method} {}",
            parts.uri.path()
        ))),
    }
}
