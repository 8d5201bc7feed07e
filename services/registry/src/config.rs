//! Registry configuration.
//!
//! ```toml
//! listen = "0.0.0.0:5000"
//! scratch-dir = "/var/tmp/registry"
//!
//! [blobs]
//! backend = "object"
//! bucket = "registry"
//! storage = { driver = "local", path = "/var/lib/registry" }
//!
//! [manifests]
//! backend = "metadata"
//! snapshot = "/var/lib/registry/metadata.json"
//! ```
//!
//! The `memory` storage driver takes a `bucket`, and can hand out pre-signed
//! download redirects with `presign` and a `[blobs.redirect]` table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use http::StatusCode;
use serde::Deserialize;
use storage::{StorageConfig, StorageError};

use crate::access::ReadOnly;
use crate::api::{DEFAULT_MAX_MANIFEST_SIZE, RegistryBuilder};
use crate::ephemeral::EphemeralFactory;
use crate::metadata::{MemoryMetadata, MetadataError};
use crate::store::{
    BlobStore, MemoryBlobStore, MemoryManifestStore, MetadataManifestStore, ObjectBlobStore,
    RedirectPolicy,
};

/// Errors turning configuration into a registry.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be parsed.
    #[error("invalid configuration")]
    Parse(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Redirect status is not a redirect.
    #[error("{0} is not a redirect status")]
    RedirectStatus(u16),

    /// Object storage could not be set up.
    #[error("object storage")]
    Storage(#[from] StorageError),

    /// Metadata snapshot could not be loaded.
    #[error("metadata snapshot")]
    Metadata(#[from] MetadataError),
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_true() -> bool {
    true
}

fn default_max_manifest_size() -> usize {
    DEFAULT_MAX_MANIFEST_SIZE
}

fn default_bucket() -> String {
    "registry".into()
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Address to serve on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Buffer uploads in temporary files here, rather than in memory.
    #[serde(default)]
    pub scratch_dir: Option<Utf8PathBuf>,

    /// Serve the referrers API.
    #[serde(default = "default_true")]
    pub referrers: bool,

    /// Largest manifest accepted, in bytes.
    #[serde(default = "default_max_manifest_size")]
    pub max_manifest_size: usize,

    /// Refuse pushes and deletes.
    #[serde(default)]
    pub read_only: bool,

    /// Where blobs live.
    #[serde(default)]
    pub blobs: BlobConfig,

    /// Where manifest references live.
    #[serde(default)]
    pub manifests: ManifestConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            scratch_dir: None,
            referrers: true,
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
            read_only: false,
            blobs: BlobConfig::default(),
            manifests: ManifestConfig::default(),
        }
    }
}

/// Blob backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case", tag = "backend")]
pub enum BlobConfig {
    /// Keep blobs in process memory.
    #[default]
    Memory,

    /// Keep blobs in an object store.
    Object {
        /// Object storage driver.
        storage: StorageConfig,

        /// Bucket holding blobs and uploads.
        #[serde(default = "default_bucket")]
        bucket: String,

        /// Redirect downloads to pre-signed URLs.
        #[serde(default)]
        redirect: Option<RedirectConfig>,
    },
}

/// Pre-signed download redirects.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RedirectConfig {
    /// Lifetime of each URL.
    #[serde(default = "RedirectConfig::default_expires")]
    pub expires_secs: u64,

    /// Redirect status code.
    #[serde(default = "RedirectConfig::default_status")]
    pub status: u16,
}

impl RedirectConfig {
    fn default_expires() -> u64 {
        RedirectPolicy::default().expires.as_secs()
    }

    fn default_status() -> u16 {
        RedirectPolicy::default().status.as_u16()
    }

    /// The policy this configuration describes.
    pub fn policy(&self) -> Result<RedirectPolicy, ConfigError> {
        let status = StatusCode::from_u16(self.status)
            .ok()
            .filter(StatusCode::is_redirection)
            .ok_or(ConfigError::RedirectStatus(self.status))?;
        Ok(RedirectPolicy {
            expires: Duration::from_secs(self.expires_secs),
            status,
        })
    }
}

/// Manifest backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case", tag = "backend")]
pub enum ManifestConfig {
    /// Keep references in process memory.
    #[default]
    Memory,

    /// Record references as artifact metadata.
    Metadata {
        /// JSON snapshot to start from and rewrite on every push.
        #[serde(default)]
        snapshot: Option<Utf8PathBuf>,
    },
}

impl RegistryConfig {
    /// Parse a TOML configuration file.
    #[cfg(feature = "cli")]
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml_edit::de::from_str(text).map_err(|error| ConfigError::Parse(Box::new(error)))
    }

    /// Wire up the configured stores.
    #[tracing::instrument(skip(self))]
    pub async fn into_builder(self) -> Result<RegistryBuilder, ConfigError> {
        let ephemeral = EphemeralFactory::new(self.scratch_dir);

        let blobs = match self.blobs {
            BlobConfig::Memory => BlobStore::full(Arc::new(MemoryBlobStore::new())),
            BlobConfig::Object {
                storage,
                bucket,
                redirect,
            } => {
                let storage = storage.build().await?;
                tracing::info!(driver = storage.name(), %bucket, "object blob storage");
                let mut store = ObjectBlobStore::new(storage.bucket(bucket), ephemeral);
                if let Some(redirect) = redirect {
                    store = store.with_redirect(redirect.policy()?);
                }
                BlobStore::full(Arc::new(store))
            }
        };

        let mut builder = RegistryBuilder::new()
            .blobs(blobs)
            .referrers(self.referrers)
            .max_manifest_size(self.max_manifest_size)
            .read_only(self.read_only);

        builder = match self.manifests {
            ManifestConfig::Memory => builder.manifests(MemoryManifestStore::new()),
            ManifestConfig::Metadata { snapshot } => {
                let metadata = match snapshot {
                    Some(path) => MemoryMetadata::persistent(path).await?,
                    None => MemoryMetadata::new(),
                };
                builder.manifests(MetadataManifestStore::new(Arc::new(metadata)))
            }
        };

        if self.read_only {
            builder = builder.authorizer(ReadOnly);
        }
        Ok(builder)
    }
}
