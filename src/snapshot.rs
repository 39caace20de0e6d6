//! Offline state file
//!
//! A JSON snapshot of one platform: kits, integrations, runtime catalogs and
//! the registry's images and layers. The CLI loads it into a
//! [`PlatformCore`], runs one operation and writes it back.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use kiln_api::{Integration, Kit};

use crate::compat::{CatalogSpec, StaticCatalogs};
use crate::config::PlatformSettings;
use crate::executor::BuildExecutor;
use crate::graph::{Artifact, ArtifactGraph, GraphError};
use crate::platform::{PlatformCore, PlatformError};
use crate::registry::{InMemoryRegistry, RegistryContents};

/// Current state file schema version
pub const SCHEMA_VERSION: u32 = 1;

/// State file errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("state file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported state file schema version {0} (expected {SCHEMA_VERSION})")]
    UnsupportedSchema(u32),

    #[error("state file graph is inconsistent: {0}")]
    Graph(#[from] GraphError),

    #[error("state file bindings are inconsistent: {0}")]
    Binding(#[from] PlatformError),
}

/// Persisted platform state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    pub schema_version: u32,
    #[serde(default)]
    pub kits: Vec<Kit>,
    #[serde(default)]
    pub integrations: Vec<Integration>,
    #[serde(default)]
    pub catalogs: Vec<CatalogSpec>,
    #[serde(default)]
    pub registry: RegistryContents,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            kits: Vec::new(),
            integrations: Vec::new(),
            catalogs: Vec::new(),
            registry: RegistryContents::default(),
        }
    }
}

impl StateFile {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let state: StateFile = serde_json::from_str(json)?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(SnapshotError::UnsupportedSchema(state.schema_version));
        }
        Ok(state)
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Load `path`, or start empty when it does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, SnapshotError> {
        match fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no state file, starting empty");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write atomically (write-then-rename).
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let json = self.to_json()?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)?;
        tracing::debug!(path = %path.display(), kits = self.kits.len(), "state file written");
        Ok(())
    }

    /// Rebuild the artifact graph. Usage comes from the integrations, not
    /// from the persisted `used` flags.
    pub fn graph(&self) -> Result<ArtifactGraph, GraphError> {
        ArtifactGraph::from_artifacts(self.kits.iter().map(Artifact::from_kit))
    }

    /// Load everything into a platform driven by `executor`.
    pub fn into_platform(
        self,
        settings: PlatformSettings,
        executor: Box<dyn BuildExecutor>,
    ) -> Result<(PlatformCore, Arc<InMemoryRegistry>), SnapshotError> {
        let graph = self.graph()?;
        let registry = Arc::new(InMemoryRegistry::from_contents(self.registry));
        let mut core = PlatformCore::new(
            settings,
            graph,
            Box::new(StaticCatalogs::new(self.catalogs)),
            registry.clone(),
            executor,
        );
        core.restore_integrations(self.integrations)?;
        Ok((core, registry))
    }

    /// Capture the state of a platform loaded with [`StateFile::into_platform`].
    pub fn capture(
        core: &PlatformCore,
        registry: &InMemoryRegistry,
        catalogs: Vec<CatalogSpec>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            kits: core.kits(),
            integrations: core.integrations().cloned().collect(),
            catalogs,
            registry: registry.contents(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::RecordingExecutor;
    use crate::gc::tests::{materialize, TREE};
    use kiln_api::KitPhase;
    use tempfile::TempDir;

    fn tree_state() -> StateFile {
        let registry = InMemoryRegistry::new();
        let graph = materialize(TREE, &registry);
        let integrations = graph
            .bindings()
            .map(|(consumer, kit)| {
                let image = graph.get(kit).and_then(|a| a.image.clone());
                let mut it = Integration::new(&consumer.namespace, &consumer.name, &kit.name);
                it.image = image;
                it
            })
            .collect();
        StateFile {
            kits: graph.kits(),
            integrations,
            registry: registry.contents(),
            ..Default::default()
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let state = tree_state();

        state.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(StateFile::load(&path).unwrap(), state);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.json");
        assert!(matches!(StateFile::load(&path), Err(SnapshotError::Io(_))));
        assert_eq!(StateFile::load_or_default(&path).unwrap(), StateFile::default());
    }

    #[test]
    fn test_rejects_unknown_schema() {
        let err = StateFile::from_json(r#"{"schema_version": 9}"#).unwrap_err();
        assert!(matches!(err, SnapshotError::UnsupportedSchema(9)));
        assert!(matches!(
            StateFile::from_json("not json"),
            Err(SnapshotError::Json(_))
        ));
    }

    #[test]
    fn test_usage_comes_from_integrations() {
        let mut state = tree_state();
        for kit in &mut state.kits {
            kit.used = false;
        }
        let (core, _) = state
            .into_platform(PlatformSettings::default(), Box::new(RecordingExecutor::new()))
            .unwrap();
        let used: Vec<String> = core
            .kits()
            .into_iter()
            .filter(|k| k.used)
            .map(|k| k.name)
            .collect();
        assert_eq!(used, vec!["c", "g", "j", "k"]);
    }

    #[test]
    fn test_platform_round_trip() {
        let state = tree_state();
        let (core, registry) = state
            .clone()
            .into_platform(PlatformSettings::default(), Box::new(RecordingExecutor::new()))
            .unwrap();
        let captured = StateFile::capture(&core, &registry, Vec::new());
        assert_eq!(captured, state);
        assert!(captured.kits.iter().all(|k| k.phase == KitPhase::Ready));
    }

    #[test]
    fn test_binding_to_missing_kit() {
        let mut state = tree_state();
        state
            .integrations
            .push(Integration::new("default", "orphan", "nope"));
        let err = state
            .into_platform(PlatformSettings::default(), Box::new(RecordingExecutor::new()))
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Binding(_)));
    }
}
