//! Tree-notation fixtures
//!
//! Lineages are written in preorder as `NAME(t|f)` entries, where `t` marks
//! a used kit and `f` an unused one. Each entry is a child of the entry
//! before it; `|` closes the children of the current entry. For example
//! `a(f)b(f)e(f)|f(f)k(t)|||c(t)|` is `a -> b -> {e, f -> k}` plus `a -> c`.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use kiln_api::{Integration, KitPhase, KitType};

use super::{Artifact, ArtifactGraph, ArtifactId, ConsumerId, GraphError};
use crate::fingerprint::{fingerprint, FingerprintError};
use crate::registry::{ImageManifest, Layer, Registry, RegistryError};

/// Fixture errors
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("unexpected '{found}' at offset {offset}")]
    Unexpected { offset: usize, found: char },

    #[error("unterminated entry '{0}'")]
    Unterminated(String),

    #[error("kit '{0}' appears twice")]
    Duplicate(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
}

/// One parsed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureNode {
    pub name: String,
    pub used: bool,
    pub parent: Option<String>,
}

/// A parsed tree, in preorder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeFixture {
    nodes: Vec<FixtureNode>,
}

/// Graph, registry images and integrations built from a fixture.
#[derive(Debug)]
pub struct Materialized {
    pub graph: ArtifactGraph,
    pub integrations: Vec<Integration>,
}

impl TreeFixture {
    pub fn parse(tree: &str) -> Result<Self, FixtureError> {
        let mut nodes: Vec<FixtureNode> = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = Vec::new();
        let mut chars = tree.char_indices().peekable();

        while let Some(&(offset, c)) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
                continue;
            }
            if c == '|' {
                chars.next();
                stack.pop();
                continue;
            }
            if !(c.is_ascii_lowercase() || c.is_ascii_digit()) {
                return Err(FixtureError::Unexpected { offset, found: c });
            }

            let mut name = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }

            let flag: String = chars.by_ref().take(3).map(|(_, c)| c).collect();
            let used = match flag.as_str() {
                "(t)" => true,
                "(f)" => false,
                _ => return Err(FixtureError::Unterminated(name)),
            };
            if !seen.insert(name.clone()) {
                return Err(FixtureError::Duplicate(name));
            }
            nodes.push(FixtureNode {
                name: name.clone(),
                used,
                parent: stack.last().cloned(),
            });
            stack.push(name);
        }

        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[FixtureNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names of the used kits, in preorder.
    pub fn used(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.used)
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Build the lineage for real.
    ///
    /// Every kit gets an image holding its parent's layers plus one layer of
    /// its own, and its dependencies extend its parent's. Used kits get an
    /// integration of the same name bound to them.
    pub fn materialize(
        &self,
        namespace: &str,
        repository: &str,
        operator_version: &str,
        registry: &dyn Registry,
        now: DateTime<Utc>,
    ) -> Result<Materialized, FixtureError> {
        let mut graph = ArtifactGraph::new();
        let mut manifests: BTreeMap<&str, ImageManifest> = BTreeMap::new();
        let mut integrations = Vec::new();

        for (i, node) in self.nodes.iter().enumerate() {
            let parent = node.parent.as_deref();
            let mut manifest = parent
                .and_then(|p| manifests.get(p).cloned())
                .unwrap_or_default();
            let layer = Layer::new().with_file(
                format!("kits/{}", node.name),
                format!("layer of {}", node.name),
            );
            manifest.layers.push(registry.write_layer(&layer)?);
            manifest.history.push(format!("kit {}", node.name));
            let image = registry.write_image(repository, &manifest)?;
            let digest = manifest.digest()?;

            let mut dependencies = parent
                .and_then(|p| graph.get(&ArtifactId::new(namespace, p)))
                .map(|a| a.dependencies.clone())
                .unwrap_or_default();
            dependencies.insert(format!("fixture:{}", node.name));
            let build_properties = BTreeMap::new();
            let runtime_version = "1.0.0".to_string();

            let base = parent.map(|p| ArtifactId::new(namespace, p));
            let base_image = base
                .as_ref()
                .and_then(|b| graph.get(b))
                .and_then(|a| a.image.clone());

            graph.add_artifact(Artifact {
                id: ArtifactId::new(namespace, node.name.clone()),
                fingerprint: fingerprint(&dependencies, &build_properties, &runtime_version)?,
                dependencies,
                build_properties,
                runtime_version,
                base,
                base_image,
                image: Some(image.clone()),
                digest: Some(digest),
                priority: 0,
                version: operator_version.to_string(),
                phase: KitPhase::Ready,
                kit_type: KitType::Platform,
                created_at: now + Duration::seconds(i as i64),
            })?;
            manifests.insert(node.name.as_str(), manifest);

            if node.used {
                let mut integration = Integration::new(namespace, node.name.clone(), node.name.clone());
                integration.image = Some(image);
                graph.bind_consumer(
                    ConsumerId::new(namespace, node.name.clone()),
                    &ArtifactId::new(namespace, node.name.clone()),
                )?;
                integrations.push(integration);
            }
        }

        Ok(Materialized {
            graph,
            integrations,
        })
    }
}
