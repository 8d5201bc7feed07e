//! Authorization and audit hooks.
//!
//! The registry does not decide who may do what. Every request is described as an
//! [`AccessRequest`] and handed to an [`Authorizer`]; successful pulls are reported
//! to an [`AuditSink`].

use std::fmt;

use crate::digest::Digest;
use crate::name::{Reference, RepositoryName};

/// What a request wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Read blobs, manifests, tags or referrers.
    Pull,
    /// Upload blobs or manifests.
    Push,
    /// Remove blobs or manifests.
    Delete,
    /// List repositories.
    Catalog,
}

impl Action {
    /// Whether this action changes registry content.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Action::Push | Action::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Pull => "pull",
            Action::Push => "push",
            Action::Delete => "delete",
            Action::Catalog => "catalog",
        })
    }
}

/// A single authorization question.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    /// Requested operation.
    pub action: Action,
    /// Repository addressed, absent for catalog listings.
    pub repository: Option<RepositoryName>,
    /// Tag or digest addressed, when there is one.
    pub reference: Option<Reference>,
    /// Raw `Authorization` header, passed through untouched.
    pub credentials: Option<String>,
}

impl AccessRequest {
    /// A request against one repository.
    pub fn repository(action: Action, repository: &RepositoryName) -> Self {
        Self {
            action,
            repository: Some(repository.clone()),
            reference: None,
            credentials: None,
        }
    }

    /// A catalog listing request.
    pub fn catalog() -> Self {
        Self {
            action: Action::Catalog,
            repository: None,
            reference: None,
            credentials: None,
        }
    }

    /// Attach the addressed tag or digest.
    pub fn with_reference(mut self, reference: impl Into<Reference>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Attach caller credentials.
    pub fn with_credentials(mut self, credentials: Option<String>) -> Self {
        self.credentials = credentials;
        self
    }
}

impl fmt::Display for AccessRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action)?;
        if let Some(repository) = &self.repository {
            write!(f, " {repository}")?;
        }
        if let Some(reference) = &self.reference {
            write!(f, ":{reference}")?;
        }
        Ok(())
    }
}

/// Refusal from an [`Authorizer`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct Denied {
    reason: String,
}

impl Denied {
    /// Deny with a reason shown to the client.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Yes/no access decisions.
#[async_trait::async_trait]
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// Allow or deny one request.
    async fn authorize(&self, request: &AccessRequest) -> Result<(), Denied>;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _request: &AccessRequest) -> Result<(), Denied> {
        Ok(())
    }
}

/// Allows reads, denies pushes and deletes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

#[async_trait::async_trait]
impl Authorizer for ReadOnly {
    async fn authorize(&self, request: &AccessRequest) -> Result<(), Denied> {
        if request.action.is_mutating() {
            return Err(Denied::new(format!("{request}: registry is read-only")));
        }
        Ok(())
    }
}

/// What was pulled.
#[derive(Debug, Clone)]
pub enum PullEvent {
    /// A manifest was served.
    Manifest {
        /// Repository.
        repository: RepositoryName,
        /// Reference the client asked for.
        reference: Reference,
        /// Digest of the served manifest.
        digest: Digest,
    },
    /// A blob was served or redirected to.
    Blob {
        /// Repository.
        repository: RepositoryName,
        /// Blob digest.
        digest: Digest,
    },
}

/// Receives notifications about successful pulls.
#[async_trait::async_trait]
pub trait AuditSink: fmt::Debug + Send + Sync {
    /// Record a pull.
    async fn pulled(&self, event: &PullEvent);
}

/// Writes pull events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

#[async_trait::async_trait]
impl AuditSink for TracingAudit {
    async fn pulled(&self, event: &PullEvent) {
        match event {
            PullEvent::Manifest {
                repository,
                reference,
                digest,
            } => tracing::info!(%repository, %reference, %digest, "manifest pulled"),
            PullEvent::Blob { repository, digest } => {
                tracing::info!(%repository, %digest, "blob pulled")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_only_denies_pushes() {
        let repo: RepositoryName = "acme/app".parse().unwrap();
        let pull = AccessRequest::repository(Action::Pull, &repo);
        let push = AccessRequest::repository(Action::Push, &repo)
            .with_reference(Reference::Tag("v1".into()));

        assert!(ReadOnly.authorize(&pull).await.is_ok());
        let denied = ReadOnly.authorize(&push).await.unwrap_err();
        assert_eq!(denied.to_string(), "push acme/app:v1: registry is read-only");

        assert!(AllowAll.authorize(&push).await.is_ok());
        assert!(ReadOnly.authorize(&AccessRequest::catalog()).await.is_ok());
    }
}
