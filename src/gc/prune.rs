//! Prune unreachable kits and their images.

use std::collections::{BTreeMap, BTreeSet};

use kiln_api::KitType;

use super::{in_flight_lineage, GcError, PruneOutcome, PruneScope};
use crate::graph::{ArtifactGraph, ArtifactId, GraphError};
use crate::registry::{Registry, RegistryError};

/// What a prune would delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    pub artifacts: Vec<ArtifactId>,
    /// Image to the planned kits referencing it.
    pub images: BTreeMap<String, Vec<ArtifactId>>,
}

/// Compute the kits and images a prune of `scope` deletes.
///
/// External kits are never selected, nor are Building kits and the
/// lineage they build on. Images are only deleted for kits outside the
/// used lineage, and only when no retained kit shares them.
pub fn plan_prune(graph: &ArtifactGraph, scope: PruneScope) -> Result<PrunePlan, GcError> {
    let in_flight = in_flight_lineage(graph)?;
    let reachable = graph.reachable_from_used();

    let artifacts: Vec<ArtifactId> = graph
        .ids()
        .filter(|id| graph.get(id).map(|a| a.kit_type) == Some(KitType::Platform))
        .filter(|id| !in_flight.contains(*id))
        .filter(|id| match scope {
            PruneScope::Lineage => !reachable.contains(*id),
            PruneScope::Unreferenced => !graph.is_used(id),
        })
        .cloned()
        .collect();

    if let Some(used) = artifacts.iter().find(|id| graph.is_used(id)) {
        return Err(GcError::Invariant(format!(
            "prune selected used kit {}",
            used
        )));
    }

    let doomed: BTreeSet<&ArtifactId> = artifacts.iter().collect();
    let retained_images: BTreeSet<&str> = graph
        .iter()
        .filter(|a| !doomed.contains(&a.id))
        .filter_map(|a| a.image.as_deref())
        .collect();

    let mut images: BTreeMap<String, Vec<ArtifactId>> = BTreeMap::new();
    for id in &artifacts {
        if reachable.contains(id) {
            continue;
        }
        let Some(image) = graph.get(id).and_then(|a| a.image.as_deref()) else {
            continue;
        };
        if retained_images.contains(image) {
            continue;
        }
        images.entry(image.to_string()).or_default().push(id.clone());
    }

    Ok(PrunePlan { artifacts, images })
}

/// Delete unreachable kits and their images.
///
/// Deletions are independent: an image that cannot be deleted keeps the
/// kits referencing it so the next run retries them. Re-running on a pruned
/// graph deletes nothing.
pub fn prune(
    graph: &mut ArtifactGraph,
    registry: &dyn Registry,
    scope: PruneScope,
    dry_run: bool,
) -> Result<PruneOutcome, GcError> {
    let plan = plan_prune(graph, scope)?;
    tracing::info!(
        %scope,
        dry_run,
        artifacts = plan.artifacts.len(),
        images = plan.images.len(),
        "prune planned"
    );

    if dry_run {
        return Ok(PruneOutcome {
            dry_run,
            artifacts: plan.artifacts,
            images: plan.images.into_keys().collect(),
            ..Default::default()
        });
    }

    let mut outcome = PruneOutcome::default();
    let mut kept = BTreeSet::new();
    for (image, owners) in &plan.images {
        match registry.delete_image(image) {
            Ok(()) => {
                tracing::info!(%image, "image deleted");
                outcome.images.push(image.clone());
            }
            Err(RegistryError::ImageNotFound(_)) => {
                tracing::debug!(%image, "image already gone");
            }
            Err(e) => {
                tracing::warn!(%image, error = %e, "image deletion failed, keeping kits");
                outcome.errors.push(format!("delete image {}: {}", image, e));
                kept.extend(owners.iter().cloned());
            }
        }
    }

    for id in plan.artifacts {
        if kept.contains(&id) {
            outcome.kept.push(id);
            continue;
        }
        match graph.remove_artifact(&id) {
            Ok(_) => {
                tracing::info!(kit = %id, "kit deleted");
                outcome.artifacts.push(id);
            }
            Err(GraphError::NotFound(_)) => {}
            Err(GraphError::StillUsed { id, consumers }) => {
                return Err(GcError::Invariant(format!(
                    "kit {} selected for prune has {} consumer(s)",
                    id, consumers
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(outcome)
}
