//! Image registry abstraction
//!
//! The garbage collector only needs a handful of operations: write and read
//! layers, write and read image manifests, delete images. Layers and
//! manifests are content addressed: digests are SHA-256 over RFC 8785
//! canonical JSON.

mod memory;

pub use memory::{InMemoryRegistry, RegistryContents};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Prefix of whiteout entries hiding a file from lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error("layer {0} not found")]
    LayerNotFound(String),

    #[error("invalid image reference '{0}'")]
    InvalidReference(String),

    #[error("digest mismatch for {reference}: expected {expected}, got {actual}")]
    DigestMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("canonicalization failed: {0}")]
    Canonicalize(String),
}

/// SHA-256 over the canonical JSON form of `value`, as `sha256:<hex>`.
pub fn content_digest<T: Serialize>(value: &T) -> Result<String, RegistryError> {
    let jcs_bytes = serde_json_canonicalizer::to_vec(value)
        .map_err(|e| RegistryError::Canonicalize(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&jcs_bytes);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Digest-pinned reference: `{repository}@{digest}`.
pub fn image_reference(repository: &str, digest: &str) -> String {
    format!("{}@{}", repository, digest)
}

/// Split a digest-pinned reference into repository and digest.
pub fn parse_reference(reference: &str) -> Result<(&str, &str), RegistryError> {
    match reference.rsplit_once('@') {
        Some((repo, digest)) if !repo.is_empty() && digest.starts_with("sha256:") => {
            Ok((repo, digest))
        }
        _ => Err(RegistryError::InvalidReference(reference.to_string())),
    }
}

/// One filesystem layer: path to contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(with = "b64_files")]
    pub files: BTreeMap<String, Vec<u8>>,
}

impl Layer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    /// Add a whiteout for `path`.
    pub fn with_whiteout(mut self, path: &str) -> Self {
        self.files.insert(whiteout_for(path), Vec::new());
        self
    }

    pub fn digest(&self) -> Result<String, RegistryError> {
        content_digest(self)
    }
}

fn whiteout_for(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, file)) => format!("{}/{}{}", dir, WHITEOUT_PREFIX, file),
        None => format!("{}{}", WHITEOUT_PREFIX, path),
    }
}

/// Path hidden by a whiteout entry, if `path` is one.
fn whiteout_target(path: &str) -> Option<String> {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };
    let target = file.strip_prefix(WHITEOUT_PREFIX)?;
    Some(match dir {
        Some(dir) => format!("{}/{}", dir, target),
        None => target.to_string(),
    })
}

/// Merge layers in order into one.
///
/// Later layers override earlier files. A whiteout removes the file it hides
/// and is kept in the result so it still hides that file in layers below
/// the merged one; a later regular file drops the matching whiteout.
pub fn flatten_layers<'a, I>(layers: I) -> Layer
where
    I: IntoIterator<Item = &'a Layer>,
{
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (path, contents) in &layer.files {
            match whiteout_target(path) {
                Some(target) => {
                    merged.remove(&target);
                    merged.insert(path.clone(), Vec::new());
                }
                None => {
                    merged.remove(&whiteout_for(path));
                    merged.insert(path.clone(), contents.clone());
                }
            }
        }
    }
    Layer { files: merged }
}

/// Image manifest: ordered layer digests plus history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub layers: Vec<String>,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn digest(&self) -> Result<String, RegistryError> {
        content_digest(self)
    }

    /// Whether `base` is a layer prefix of this image.
    pub fn is_layered_on(&self, base: &ImageManifest) -> bool {
        self.layers.starts_with(&base.layers)
    }
}

/// Operations the core needs from an image registry.
pub trait Registry: Send + Sync {
    /// Store a layer, returning its digest.
    fn write_layer(&self, layer: &Layer) -> Result<String, RegistryError>;

    fn read_layer(&self, digest: &str) -> Result<Layer, RegistryError>;

    /// Store a manifest under `repository`, returning its digest reference.
    fn write_image(&self, repository: &str, manifest: &ImageManifest)
        -> Result<String, RegistryError>;

    fn read_image(&self, reference: &str) -> Result<ImageManifest, RegistryError>;

    fn delete_image(&self, reference: &str) -> Result<(), RegistryError>;

    fn image_exists(&self, reference: &str) -> bool {
        self.read_image(reference).is_ok()
    }
}

mod b64_files {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        files: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&String, String> =
            files.iter().map(|(k, v)| (k, STANDARD.encode(v))).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v.as_bytes())
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
