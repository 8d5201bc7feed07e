//! # OCI Container Registry
//!
//! This module implements an OCI-compliant container registry server following
//! the [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec).
//!
//! ## Features
//!
//! - Blob push (single request, chunked and resumable, cross-repository mount)
//! - Blob pull with byte ranges and pre-signed redirects
//! - Manifest and index push and pull, tag listing, catalog, referrers
//! - Pluggable blob stores: in memory, or object storage via the `storage` crate
//! - Pluggable manifest stores: in memory, or recorded as artifact metadata
//! - Authorization and audit hooks
//! - Builder pattern for configuration
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use registry::RegistryBuilder;
//! use registry::ephemeral::EphemeralFactory;
//! use registry::store::{BlobStore, MemoryManifestStore, ObjectBlobStore};
//! use storage::{MemoryStorage, Storage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage: Storage = MemoryStorage::with_buckets(&["registry"]).into();
//! let blobs = ObjectBlobStore::new(storage.bucket("registry"), EphemeralFactory::memory());
//! let registry = RegistryBuilder::new()
//!     .blobs(BlobStore::full(Arc::new(blobs)))
//!     .manifests(MemoryManifestStore::new())
//!     .build()?;
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
mod error;
mod manifest;

pub mod access;
pub mod config;
pub mod digest;
pub mod document;
pub mod ephemeral;
pub mod headers;
pub mod metadata;
pub mod name;
pub mod route;
pub mod store;
pub mod verify;

pub use api::{BuildError, DEFAULT_MAX_MANIFEST_SIZE, RegistryBuilder};
pub use digest::Digest;
pub use error::{RegistryError, RegistryResult};
pub use name::{Reference, RepositoryName, SessionId};
