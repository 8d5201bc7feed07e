//! Manifest document formats.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Whether a media type describes a single image or an index of manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// A single image: config plus layers.
    Image,
    /// A list of child manifests.
    Index,
}

impl ManifestKind {
    /// Classify a manifest media type; `None` for types the registry does not accept.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        let essence = media_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        match essence {
            OCI_MANIFEST | DOCKER_MANIFEST => Some(ManifestKind::Image),
            OCI_INDEX | DOCKER_MANIFEST_LIST => Some(ManifestKind::Index),
            _ => None,
        }
    }
}

/// A typed reference to content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Size of the referenced content.
    pub size: u64,
    /// Alternative download locations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    /// Artifact type, for artifact manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Whether the content must be present in this registry.
    ///
    /// Foreign layers, and anything listing external URLs, may live elsewhere.
    pub fn is_distributable(&self) -> bool {
        self.urls.is_empty()
            && !self.media_type.contains("nondistributable")
            && !self.media_type.contains("foreign")
    }
}

/// An image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always 2.
    pub schema_version: u32,
    /// The manifest's own media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Artifact type, for artifact manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Image configuration.
    pub config: Descriptor,
    /// Filesystem layers.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// The manifest this one refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    /// Config and layer digests.
    pub fn blobs(&self) -> Vec<Digest> {
        std::iter::once(&self.config)
            .chain(&self.layers)
            .map(|descriptor| descriptor.digest.clone())
            .collect()
    }
}

/// An image index or manifest list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2.
    pub schema_version: u32,
    /// The index's own media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Artifact type, for artifact indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Child manifests.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    /// The manifest this one refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// An OCI index listing `manifests`.
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_INDEX.to_string()),
            artifact_type: None,
            manifests,
            subject: None,
            annotations: BTreeMap::new(),
        }
    }
}

/// Just the fields of any manifest kind that matter for referrers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferrerFields {
    /// Declared artifact type.
    #[serde(default)]
    pub artifact_type: Option<String>,
    /// Config descriptor, for image manifests.
    #[serde(default)]
    pub config: Option<ConfigMediaType>,
    /// Subject descriptor.
    #[serde(default)]
    pub subject: Option<SubjectDigest>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// The media type of a config descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMediaType {
    /// Config media type.
    pub media_type: Option<String>,
}

/// The digest of a subject descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectDigest {
    /// Subject digest, kept as a string so malformed subjects are simply ignored.
    pub digest: String,
}

impl ReferrerFields {
    /// The artifact type a referrers listing reports for this manifest.
    pub fn effective_artifact_type(&self) -> Option<String> {
        self.artifact_type
            .clone()
            .or_else(|| self.config.as_ref()?.media_type.clone())
    }

    /// Whether this manifest's subject is `digest`.
    pub fn refers_to(&self, digest: &Digest) -> bool {
        self.subject
            .as_ref()
            .is_some_and(|subject| subject.digest == digest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn media_types() {
        assert_eq!(
            ManifestKind::from_media_type(OCI_MANIFEST),
            Some(ManifestKind::Image)
        );
        assert_eq!(
            ManifestKind::from_media_type("application/vnd.oci.image.index.v1+json; charset=utf-8"),
            Some(ManifestKind::Index)
        );
        assert_eq!(
            ManifestKind::from_media_type(DOCKER_MANIFEST_LIST),
            Some(ManifestKind::Index)
        );
        assert_eq!(ManifestKind::from_media_type("application/json"), None);
    }

    #[test]
    fn descriptors_parse_and_classify() {
        let digest = Digest::sha256(b"layer");
        let layer: Descriptor = serde_json::from_value(json!({
            "mediaType": "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
            "digest": digest.to_string(),
            "size": 5,
        }))
        .unwrap();
        assert!(!layer.is_distributable());

        let child: Descriptor = serde_json::from_value(json!({
            "mediaType": OCI_MANIFEST,
            "digest": digest.to_string(),
            "size": 5,
            "platform": {"os": "linux"},
        }))
        .unwrap();
        assert!(child.is_distributable());

        assert!(serde_json::from_value::<Descriptor>(json!({
            "mediaType": OCI_MANIFEST,
            "digest": "sha256:nope",
            "size": 5,
        }))
        .is_err());
    }

    #[test]
    fn referrer_fields() {
        let subject = Digest::sha256(b"subject");
        let fields: ReferrerFields = serde_json::from_value(json!({
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.example.sbom", "digest": subject.to_string(), "size": 1},
            "layers": [],
            "subject": {"mediaType": OCI_MANIFEST, "digest": subject.to_string(), "size": 1},
        }))
        .unwrap();
        assert!(fields.refers_to(&subject));
        assert_eq!(
            fields.effective_artifact_type().as_deref(),
            Some("application/vnd.example.sbom")
        );
    }
}
