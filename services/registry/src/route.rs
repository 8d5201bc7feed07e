//! Classify `/v2/` request paths.
//!
//! Repository names contain a `/`, so paths are matched by finding the endpoint
//! keyword (`blobs`, `manifests`, `tags`, `referrers`) rather than with fixed
//! route templates. The name in front of the keyword is validated here, before any
//! handler or store sees the request.

use crate::error::{RegistryError, RegistryResult};
use crate::name::RepositoryName;

/// A classified registry endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/v2/{name}/blobs/{digest}`. The last segment may also be an upload session.
    Blob {
        /// Repository.
        repository: RepositoryName,
        /// Last path segment.
        target: String,
    },
    /// `/v2/{name}/blobs/uploads/`
    Uploads {
        /// Repository.
        repository: RepositoryName,
    },
    /// `/v2/{name}/blobs/uploads/{session}`
    Upload {
        /// Repository.
        repository: RepositoryName,
        /// Session segment.
        session: String,
    },
    /// `/v2/{name}/manifests/{reference}`
    Manifest {
        /// Repository.
        repository: RepositoryName,
        /// Tag or digest segment.
        reference: String,
    },
    /// `/v2/{name}/tags/list`
    Tags {
        /// Repository.
        repository: RepositoryName,
    },
    /// `/v2/{name}/referrers/{digest}`
    Referrers {
        /// Repository.
        repository: RepositoryName,
        /// Digest segment.
        digest: String,
    },
}

impl Route {
    /// The repository addressed.
    pub fn repository(&self) -> &RepositoryName {
        match self {
            Route::Blob { repository, .. }
            | Route::Uploads { repository }
            | Route::Upload { repository, .. }
            | Route::Manifest { repository, .. }
            | Route::Tags { repository }
            | Route::Referrers { repository, .. } => repository,
        }
    }

    /// Classify a request path.
    pub fn classify(path: &str) -> RegistryResult<Self> {
        let unknown = || RegistryError::UnknownEndpoint(path.to_string());
        let rest = path.strip_prefix("/v2/").ok_or_else(unknown)?;
        let segments: Vec<&str> = rest.split('/').collect();

        // Well-formed names have two segments; otherwise find the endpoint anyway,
        // so a bad name is reported as such rather than as an unknown path.
        let split = if segments.len() > 2 && Shape::of(&segments[2..]).is_some() {
            2
        } else {
            (1..segments.len())
                .find(|&at| Shape::of(&segments[at..]).is_some())
                .ok_or_else(unknown)?
        };

        let (name, tail) = segments.split_at(split);
        let repository: RepositoryName = name.join("/").parse()?;
        let shape = Shape::of(tail).ok_or_else(unknown)?;

        Ok(match shape {
            Shape::Blob(target) => Route::Blob {
                repository,
                target: target.to_string(),
            },
            Shape::Uploads => Route::Uploads { repository },
            Shape::Upload(session) => Route::Upload {
                repository,
                session: session.to_string(),
            },
            Shape::Manifest(reference) => Route::Manifest {
                repository,
                reference: reference.to_string(),
            },
            Shape::Tags => Route::Tags { repository },
            Shape::Referrers(digest) => Route::Referrers {
                repository,
                digest: digest.to_string(),
            },
        })
    }
}

enum Shape<'p> {
    Blob(&'p str),
    Uploads,
    Upload(&'p str),
    Manifest(&'p str),
    Tags,
    Referrers(&'p str),
}

impl<'p> Shape<'p> {
    fn of(tail: &[&'p str]) -> Option<Self> {
        match tail {
            ["blobs", "uploads"] | ["blobs", "uploads", ""] => Some(Shape::Uploads),
            ["blobs", "uploads", session] => Some(Shape::Upload(*session)),
            ["blobs", target] if !target.is_empty() => Some(Shape::Blob(*target)),
            ["manifests", reference] if !reference.is_empty() => Some(Shape::Manifest(*reference)),
            ["tags", "list"] => Some(Shape::Tags),
            ["referrers", digest] if !digest.is_empty() => Some(Shape::Referrers(*digest)),
            _ => None,
        }
    }
}
