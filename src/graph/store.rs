//! Single-writer access to the artifact graph.

use std::sync::{PoisonError, RwLock};

use super::ArtifactGraph;

/// Owns the graph behind a reader/writer lock.
///
/// Every mutation goes through [`GraphStore::mutate`], so prune, squash and
/// build completion are serialized. Readers see a consistent graph and may
/// run concurrently with each other.
#[derive(Debug, Default)]
pub struct GraphStore {
    inner: RwLock<ArtifactGraph>,
}

impl GraphStore {
    pub fn new(graph: ArtifactGraph) -> Self {
        Self {
            inner: RwLock::new(graph),
        }
    }

    /// Run a read-only closure against the graph.
    pub fn read<R>(&self, f: impl FnOnce(&ArtifactGraph) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Run a mutation with exclusive access.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut ArtifactGraph) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Consistent copy of the current graph.
    pub fn snapshot(&self) -> ArtifactGraph {
        self.read(ArtifactGraph::clone)
    }

    pub fn into_inner(self) -> ArtifactGraph {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}
