//! In-memory registry used by the offline CLI and tests.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

use super::{image_reference, parse_reference, ImageManifest, Layer, Registry, RegistryError};

/// Serializable registry contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryContents {
    #[serde(default)]
    pub layers: BTreeMap<String, Layer>,
    /// Digest reference to manifest.
    #[serde(default)]
    pub images: BTreeMap<String, ImageManifest>,
    /// Tag reference (e.g. `repo/base:latest`) to digest reference.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    contents: RegistryContents,
    fail_deletes: BTreeSet<String>,
    fail_writes: bool,
    corrupt_reads: bool,
    deleted: Vec<String>,
}

/// Registry backed by maps, with failure injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_contents(contents: RegistryContents) -> Self {
        Self {
            state: Mutex::new(State {
                contents,
                ..Default::default()
            }),
        }
    }

    pub fn contents(&self) -> RegistryContents {
        self.lock().contents.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point a tag reference at an existing image.
    pub fn tag(&self, tag: impl Into<String>, reference: &str) -> Result<(), RegistryError> {
        let mut state = self.lock();
        if !state.contents.images.contains_key(reference) {
            return Err(RegistryError::ImageNotFound(reference.to_string()));
        }
        state
            .contents
            .tags
            .insert(tag.into(), reference.to_string());
        Ok(())
    }

    /// Make deleting `reference` fail until cleared.
    pub fn fail_delete(&self, reference: impl Into<String>) {
        self.lock().fail_deletes.insert(reference.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_deletes.clear();
        state.fail_writes = false;
        state.corrupt_reads = false;
    }

    /// Make every write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Return manifests with an extra history entry, so read-back digests
    /// no longer match what was written.
    pub fn corrupt_reads(&self, corrupt: bool) {
        self.lock().corrupt_reads = corrupt;
    }

    /// References deleted so far, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    pub fn image_count(&self) -> usize {
        self.lock().contents.images.len()
    }

    fn resolve(contents: &RegistryContents, reference: &str) -> Option<String> {
        if contents.images.contains_key(reference) {
            return Some(reference.to_string());
        }
        contents.tags.get(reference).cloned()
    }
}

impl Registry for InMemoryRegistry {
    fn write_layer(&self, layer: &Layer) -> Result<String, RegistryError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(RegistryError::Unavailable("layer upload rejected".to_string()));
        }
        let digest = layer.digest()?;
        state.contents.layers.insert(digest.clone(), layer.clone());
        Ok(digest)
    }

    fn read_layer(&self, digest: &str) -> Result<Layer, RegistryError> {
        self.lock()
            .contents
            .layers
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::LayerNotFound(digest.to_string()))
    }

    fn write_image(
        &self,
        repository: &str,
        manifest: &ImageManifest,
    ) -> Result<String, RegistryError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(RegistryError::Unavailable("manifest upload rejected".to_string()));
        }
        if let Some(missing) = manifest
            .layers
            .iter()
            .find(|l| !state.contents.layers.contains_key(*l))
        {
            return Err(RegistryError::LayerNotFound(missing.clone()));
        }
        let reference = image_reference(repository, &manifest.digest()?);
        state
            .contents
            .images
            .insert(reference.clone(), manifest.clone());
        Ok(reference)
    }

    fn read_image(&self, reference: &str) -> Result<ImageManifest, RegistryError> {
        let state = self.lock();
        let resolved = Self::resolve(&state.contents, reference)
            .ok_or_else(|| RegistryError::ImageNotFound(reference.to_string()))?;
        let mut manifest = state
            .contents
            .images
            .get(&resolved)
            .cloned()
            .ok_or_else(|| RegistryError::ImageNotFound(reference.to_string()))?;
        if state.corrupt_reads {
            manifest.history.push("corrupted".to_string());
        }
        Ok(manifest)
    }

    fn delete_image(&self, reference: &str) -> Result<(), RegistryError> {
        parse_reference(reference)?;
        let mut state = self.lock();
        if state.fail_deletes.contains(reference) {
            return Err(RegistryError::Unavailable(format!(
                "delete of {} rejected",
                reference
            )));
        }
        if state.contents.images.remove(reference).is_none() {
            return Err(RegistryError::ImageNotFound(reference.to_string()));
        }
        state.contents.tags.retain(|_, target| target != reference);
        state.deleted.push(reference.to_string());
        Ok(())
    }
}
