//! Artifact graph
//!
//! An arena of kits keyed by [`ArtifactId`]. Each kit has at most one base
//! kit; base edges form a forest. Usage is derived from consumer bindings,
//! never stored on the artifact itself.

mod fixture;
mod store;

pub use fixture::{FixtureError, FixtureNode, Materialized, TreeFixture};
pub use store::GraphStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use kiln_api::{Kit, KitPhase, KitType};

pub use crate::id::{ArtifactId, ConsumerId};

/// Graph errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("artifact {0} already exists")]
    Duplicate(ArtifactId),

    #[error("artifact {0} not found")]
    NotFound(ArtifactId),

    #[error("base {base} of artifact {id} not found")]
    UnknownBase { id: ArtifactId, base: ArtifactId },

    #[error("artifact {id} is still used by {consumers} consumer(s)")]
    StillUsed { id: ArtifactId, consumers: usize },

    #[error("base chain through {0} forms a cycle")]
    Cycle(ArtifactId),
}

/// A kit as stored in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub fingerprint: String,
    pub dependencies: BTreeSet<String>,
    pub build_properties: BTreeMap<String, String>,
    pub runtime_version: String,
    pub base: Option<ArtifactId>,
    pub base_image: Option<String>,
    pub image: Option<String>,
    pub digest: Option<String>,
    pub priority: i32,
    pub version: String,
    pub phase: KitPhase,
    pub kit_type: KitType,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Build an artifact from its external projection. `used` is ignored.
    pub fn from_kit(kit: &Kit) -> Self {
        Self {
            id: ArtifactId::new(kit.namespace.clone(), kit.name.clone()),
            fingerprint: kit.dependency_fingerprint.clone(),
            dependencies: kit.dependencies.clone(),
            build_properties: kit.build_properties.clone(),
            runtime_version: kit.runtime_version.clone(),
            base: kit
                .base_kit
                .as_ref()
                .map(|name| ArtifactId::new(kit.namespace.clone(), name.clone())),
            base_image: kit.base_image.clone(),
            image: kit.image.clone(),
            digest: kit.digest.clone(),
            priority: kit.priority,
            version: kit.version.clone(),
            phase: kit.phase,
            kit_type: kit.kit_type,
            created_at: kit.created_at,
        }
    }

    /// External projection with the derived usage flag.
    pub fn to_kit(&self, used: bool) -> Kit {
        Kit {
            namespace: self.id.namespace.clone(),
            name: self.id.name.clone(),
            dependency_fingerprint: self.fingerprint.clone(),
            dependencies: self.dependencies.clone(),
            build_properties: self.build_properties.clone(),
            runtime_version: self.runtime_version.clone(),
            base_kit: self.base.as_ref().map(|b| b.name.clone()),
            base_image: self.base_image.clone(),
            image: self.image.clone(),
            digest: self.digest.clone(),
            used,
            priority: self.priority,
            version: self.version.clone(),
            phase: self.phase,
            kit_type: self.kit_type,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    artifact: Artifact,
    seq: u64,
    children: BTreeSet<ArtifactId>,
    consumers: BTreeSet<ConsumerId>,
}

/// The artifact DAG.
#[derive(Debug, Clone, Default)]
pub struct ArtifactGraph {
    nodes: BTreeMap<ArtifactId, Node>,
    bindings: BTreeMap<ConsumerId, ArtifactId>,
    next_seq: u64,
}

impl ArtifactGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load artifacts in any order.
    ///
    /// Bases are linked after every artifact is inserted. An artifact whose
    /// base kit is absent becomes a root and keeps its `base_image`.
    pub fn from_artifacts<I>(artifacts: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = Artifact>,
    {
        let mut graph = Self::new();
        let mut pending = Vec::new();
        for mut artifact in artifacts {
            if graph.nodes.contains_key(&artifact.id) {
                return Err(GraphError::Duplicate(artifact.id));
            }
            if let Some(base) = artifact.base.take() {
                pending.push((artifact.id.clone(), base));
            }
            graph.insert_node(artifact);
        }

        for (id, base) in pending {
            if !graph.nodes.contains_key(&base) {
                tracing::debug!(artifact = %id, base = %base, "base kit missing, treating as root");
                continue;
            }
            graph.link(&id, &base);
        }

        for id in graph.nodes.keys() {
            graph.chain_to_root(id)?;
        }
        Ok(graph)
    }

    fn insert_node(&mut self, artifact: Artifact) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.nodes.insert(
            artifact.id.clone(),
            Node {
                artifact,
                seq,
                children: BTreeSet::new(),
                consumers: BTreeSet::new(),
            },
        );
    }

    fn link(&mut self, id: &ArtifactId, base: &ArtifactId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.artifact.base = Some(base.clone());
        }
        if let Some(parent) = self.nodes.get_mut(base) {
            parent.children.insert(id.clone());
        }
    }

    fn unlink(&mut self, id: &ArtifactId) {
        let old = self
            .nodes
            .get_mut(id)
            .and_then(|node| node.artifact.base.take());
        if let Some(old) = old {
            if let Some(parent) = self.nodes.get_mut(&old) {
                parent.children.remove(id);
            }
        }
    }

    /// Insert a new artifact. Its base, if any, must already be present.
    pub fn add_artifact(&mut self, artifact: Artifact) -> Result<(), GraphError> {
        if self.nodes.contains_key(&artifact.id) {
            return Err(GraphError::Duplicate(artifact.id));
        }
        if let Some(base) = &artifact.base {
            if !self.nodes.contains_key(base) {
                return Err(GraphError::UnknownBase {
                    id: artifact.id.clone(),
                    base: base.clone(),
                });
            }
        }
        let id = artifact.id.clone();
        let base = artifact.base.clone();
        self.insert_node(artifact);
        if let Some(base) = base {
            self.link(&id, &base);
        }
        Ok(())
    }

    /// Remove an artifact that no consumer uses.
    ///
    /// Children are detached and become roots that keep their `base_image`.
    pub fn remove_artifact(&mut self, id: &ArtifactId) -> Result<Artifact, GraphError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphError::NotFound(id.clone()))?;
        if !node.consumers.is_empty() {
            return Err(GraphError::StillUsed {
                id: id.clone(),
                consumers: node.consumers.len(),
            });
        }
        let children: Vec<ArtifactId> = node.children.iter().cloned().collect();
        for child in &children {
            self.unlink(child);
        }
        self.unlink(id);
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| GraphError::NotFound(id.clone()))?;
        Ok(node.artifact)
    }

    /// Re-point an artifact at a new base (or none).
    pub fn set_base(
        &mut self,
        id: &ArtifactId,
        base: Option<ArtifactId>,
        base_image: Option<String>,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::NotFound(id.clone()));
        }
        if let Some(base) = &base {
            if !self.nodes.contains_key(base) {
                return Err(GraphError::UnknownBase {
                    id: id.clone(),
                    base: base.clone(),
                });
            }
            if base == id || self.chain_to_root(base)?.contains(id) {
                return Err(GraphError::Cycle(id.clone()));
            }
        }
        self.unlink(id);
        if let Some(base) = base {
            self.link(id, &base);
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.artifact.base_image = base_image;
        }
        Ok(())
    }

    /// Record a new image for an artifact.
    pub fn set_image(
        &mut self,
        id: &ArtifactId,
        image: Option<String>,
        digest: Option<String>,
    ) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NotFound(id.clone()))?;
        node.artifact.image = image;
        node.artifact.digest = digest;
        Ok(())
    }

    pub fn set_phase(&mut self, id: &ArtifactId, phase: KitPhase) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NotFound(id.clone()))?;
        node.artifact.phase = phase;
        Ok(())
    }

    /// Only `base_image` may change on a child; the base edge is kept.
    pub fn set_base_image(&mut self, id: &ArtifactId, image: Option<String>) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NotFound(id.clone()))?;
        node.artifact.base_image = image;
        Ok(())
    }

    pub fn get(&self, id: &ArtifactId) -> Option<&Artifact> {
        self.nodes.get(id).map(|n| &n.artifact)
    }

    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Artifacts in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.nodes.values().map(|n| &n.artifact)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ArtifactId> {
        self.nodes.keys()
    }

    /// Insertion sequence, used as the last recency tie-break.
    pub fn seq(&self, id: &ArtifactId) -> Option<u64> {
        self.nodes.get(id).map(|n| n.seq)
    }

    pub fn parent(&self, id: &ArtifactId) -> Option<&Artifact> {
        self.get(id)
            .and_then(|a| a.base.as_ref())
            .and_then(|base| self.get(base))
    }

    /// Direct children in id order.
    pub fn children(&self, id: &ArtifactId) -> Vec<&Artifact> {
        self.nodes
            .get(id)
            .map(|n| n.children.iter().filter_map(|c| self.get(c)).collect())
            .unwrap_or_default()
    }

    pub fn child_ids(&self, id: &ArtifactId) -> Vec<ArtifactId> {
        self.nodes
            .get(id)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Walk base edges from `id` to its root, leaf first.
    pub fn chain_to_root(&self, id: &ArtifactId) -> Result<Vec<ArtifactId>, GraphError> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = Some(id.clone());
        while let Some(cur) = current {
            let node = self
                .nodes
                .get(&cur)
                .ok_or_else(|| GraphError::NotFound(cur.clone()))?;
            if !seen.insert(cur.clone()) {
                return Err(GraphError::Cycle(cur));
            }
            current = node.artifact.base.clone();
            chain.push(cur);
        }
        Ok(chain)
    }

    /// Every artifact that is used, or is an ancestor of a used artifact.
    pub fn reachable_from_used(&self) -> BTreeSet<ArtifactId> {
        let mut reachable = BTreeSet::new();
        for (id, node) in &self.nodes {
            if node.consumers.is_empty() {
                continue;
            }
            let mut current = Some(id);
            while let Some(cur) = current {
                if !reachable.insert(cur.clone()) {
                    break;
                }
                current = self
                    .nodes
                    .get(cur)
                    .and_then(|n| n.artifact.base.as_ref());
            }
        }
        reachable
    }

    /// Bind a consumer to an artifact, replacing any previous binding.
    pub fn bind_consumer(
        &mut self,
        consumer: ConsumerId,
        artifact: &ArtifactId,
    ) -> Result<Option<ArtifactId>, GraphError> {
        if !self.nodes.contains_key(artifact) {
            return Err(GraphError::NotFound(artifact.clone()));
        }
        let previous = self.unbind_consumer(&consumer);
        if let Some(node) = self.nodes.get_mut(artifact) {
            node.consumers.insert(consumer.clone());
        }
        self.bindings.insert(consumer, artifact.clone());
        Ok(previous)
    }

    /// Drop a consumer binding. Returns the artifact it was bound to.
    pub fn unbind_consumer(&mut self, consumer: &ConsumerId) -> Option<ArtifactId> {
        let artifact = self.bindings.remove(consumer)?;
        if let Some(node) = self.nodes.get_mut(&artifact) {
            node.consumers.remove(consumer);
        }
        Some(artifact)
    }

    pub fn binding(&self, consumer: &ConsumerId) -> Option<&ArtifactId> {
        self.bindings.get(consumer)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&ConsumerId, &ArtifactId)> {
        self.bindings.iter()
    }

    pub fn consumers(&self, id: &ArtifactId) -> Vec<ConsumerId> {
        self.nodes
            .get(id)
            .map(|n| n.consumers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Directly used: at least one consumer resolves to it.
    pub fn is_used(&self, id: &ArtifactId) -> bool {
        self.nodes
            .get(id)
            .map(|n| !n.consumers.is_empty())
            .unwrap_or(false)
    }

    /// Whether another artifact than `except` references `image`.
    pub fn image_shared(&self, image: &str, except: &ArtifactId) -> bool {
        self.nodes
            .iter()
            .any(|(id, n)| id != except && n.artifact.image.as_deref() == Some(image))
    }

    /// External projection of every kit, in id order.
    pub fn kits(&self) -> Vec<Kit> {
        self.nodes
            .values()
            .map(|n| n.artifact.to_kit(!n.consumers.is_empty()))
            .collect()
    }

    pub fn kit(&self, id: &ArtifactId) -> Option<Kit> {
        self.nodes
            .get(id)
            .map(|n| n.artifact.to_kit(!n.consumers.is_empty()))
    }

    /// Whether any kit is still being built.
    pub fn has_building(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.artifact.phase == KitPhase::Building)
    }
}
