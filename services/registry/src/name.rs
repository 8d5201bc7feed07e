//! Repository names, manifest references and upload session identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::digest::Digest;
use crate::error::RegistryError;

const MAX_TAG_LEN: usize = 128;

/// A two-segment repository namespace, `organization/artifact`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName {
    organization: String,
    artifact: String,
}

impl RepositoryName {
    /// Build a repository name from its two components.
    pub fn new(organization: &str, artifact: &str) -> Result<Self, RegistryError> {
        let name = format!("{organization}/{artifact}");
        if !is_component(organization) || !is_component(artifact) {
            return Err(RegistryError::InvalidRepository(name));
        }
        Ok(Self {
            organization: organization.to_string(),
            artifact: artifact.to_string(),
        })
    }

    /// The organization component.
    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// The artifact component.
    pub fn artifact(&self) -> &str {
        &self.artifact
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization, self.artifact)
    }
}

impl FromStr for RepositoryName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(organization), Some(artifact), None) => Self::new(organization, artifact),
            _ => Err(RegistryError::InvalidRepository(s.to_string())),
        }
    }
}

impl Serialize for RepositoryName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RepositoryName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// A path component: lowercase alphanumerics separated by `.`, `_`, `__` or runs of `-`.
fn is_component(value: &str) -> bool {
    let bytes = value.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !alnum(first) || !alnum(last) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(&bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(&bytes[i]) {
            i += 1;
        }
        let separator = &value[start..i];
        let valid = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !valid {
            return false;
        }
    }
    true
}

/// A manifest reference: either a tag or a content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    /// A mutable, human-assigned tag.
    Tag(String),
    /// An immutable content digest.
    Digest(Digest),
}

impl Reference {
    /// Parse a reference from a URL path segment.
    ///
    /// Anything containing `:` must be a valid digest, otherwise it must be a valid tag.
    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        if value.contains(':') {
            return Digest::parse(value).map(Reference::Digest);
        }

        let bytes = value.as_bytes();
        let valid = !bytes.is_empty()
            && bytes.len() <= MAX_TAG_LEN
            && (bytes[0].is_ascii_alphanumeric() || bytes[0] == b'_')
            && bytes[1..]
                .iter()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
        if !valid {
            return Err(RegistryError::InvalidTag(value.to_string()));
        }
        Ok(Reference::Tag(value.to_string()))
    }

    /// The tag, if this reference is one.
    pub fn as_tag(&self) -> Option<&str> {
        match self {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }

    /// The digest, if this reference is one.
    pub fn as_digest(&self) -> Option<&Digest> {
        match self {
            Reference::Tag(_) => None,
            Reference::Digest(digest) => Some(digest),
        }
    }
}

impl From<Digest> for Reference {
    fn from(value: Digest) -> Self {
        Reference::Digest(value)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

/// Opaque identifier of a chunked upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// A fresh random session identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}
