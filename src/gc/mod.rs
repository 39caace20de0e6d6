//! Kit garbage collection
//!
//! Two passes over the artifact graph:
//! - prune deletes kits no live integration can reach, and their images;
//! - squash flattens straight used lineages into a single image layer and
//!   redeploys the integrations running on them.
//!
//! Both compute a plan first; dry-run returns the plan without touching the
//! graph or the registry. Text rendering lives in [`report`].

mod prune;
pub mod report;
mod squash;

pub use prune::{plan_prune, prune, PrunePlan};
pub use squash::{plan_squash, squash, SquashPlan};

use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

use kiln_api::KitPhase;

use crate::graph::{ArtifactGraph, ArtifactId, ConsumerId, GraphError};

/// GC errors. Registry failures on single items are reported in the
/// outcome instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GcError {
    #[error("graph invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Which kits prune removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PruneScope {
    /// Kits neither used nor an ancestor of a used kit.
    #[default]
    Lineage,
    /// Every kit no integration uses directly.
    Unreferenced,
}

impl std::fmt::Display for PruneScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PruneScope::Lineage => write!(f, "lineage"),
            PruneScope::Unreferenced => write!(f, "unreferenced"),
        }
    }
}

/// Result of a prune run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneOutcome {
    pub dry_run: bool,
    /// Kits deleted (or to delete, in dry-run).
    pub artifacts: Vec<ArtifactId>,
    /// Images deleted (or to delete, in dry-run).
    pub images: Vec<String>,
    /// Kits kept because their image could not be deleted.
    pub kept: Vec<ArtifactId>,
    pub errors: Vec<String>,
}

impl PruneOutcome {
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.images.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// One squashed (or squashable) chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SquashedChain {
    /// Chain members, leaf first.
    pub members: Vec<ArtifactId>,
    /// Integrations bound to the leaf.
    pub consumers: Vec<ConsumerId>,
    /// New leaf image; `None` in dry-run.
    pub image: Option<String>,
    pub digest: Option<String>,
    /// Leaf image before the squash.
    pub previous_image: Option<String>,
}

impl SquashedChain {
    pub fn leaf(&self) -> &ArtifactId {
        &self.members[0]
    }
}

/// Result of a squash run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SquashOutcome {
    pub dry_run: bool,
    pub chains: Vec<SquashedChain>,
    /// Old leaf images removed from the registry.
    pub deleted_images: Vec<String>,
    pub errors: Vec<String>,
}

impl SquashOutcome {
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Every integration that was (or would be) redeployed.
    pub fn redeployed(&self) -> Vec<ConsumerId> {
        let mut all: Vec<ConsumerId> = self
            .chains
            .iter()
            .flat_map(|c| c.consumers.iter().cloned())
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

/// Kits a build in flight depends on: every Building kit and its lineage.
///
/// GC leaves these alone so it can run alongside steady build traffic.
fn in_flight_lineage(graph: &ArtifactGraph) -> Result<BTreeSet<ArtifactId>, GcError> {
    let mut protected = BTreeSet::new();
    for kit in graph.iter().filter(|a| a.phase == KitPhase::Building) {
        protected.extend(graph.chain_to_root(&kit.id)?);
    }
    Ok(protected)
}
