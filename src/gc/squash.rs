//! Squash straight used lineages into one flattened layer.
//!
//! A chain starts at a directly used kit and climbs through parents that are
//! neither used themselves nor shared with another used lineage. The leaf
//! keeps its id and fingerprint; its new image is the chain top's base image
//! plus one layer holding everything the chain added on top of it.

use std::collections::BTreeSet;
use thiserror::Error;

use kiln_api::KitType;

use super::{in_flight_lineage, GcError, SquashOutcome, SquashedChain};
use crate::graph::{ArtifactGraph, ArtifactId, GraphError};
use crate::registry::{flatten_layers, parse_reference, ImageManifest, Registry, RegistryError};

/// Squashable chains, each leaf first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SquashPlan {
    pub chains: Vec<Vec<ArtifactId>>,
}

#[derive(Debug, Error)]
enum ChainError {
    #[error("kit {0} has no image")]
    NoImage(ArtifactId),

    #[error("image {image} is not layered on base image {base}")]
    NotLayered { image: String, base: String },

    #[error("image {0} adds no layers over its base")]
    NothingToFlatten(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

struct Flattened {
    image: String,
    digest: String,
    previous_image: String,
}

/// Find the chains a squash would flatten.
pub fn plan_squash(graph: &ArtifactGraph) -> Result<SquashPlan, GcError> {
    let in_flight = in_flight_lineage(graph)?;
    let reachable = graph.reachable_from_used();
    let used_children = |id: &ArtifactId| {
        graph
            .child_ids(id)
            .iter()
            .filter(|c| reachable.contains(*c))
            .count()
    };

    let mut chains = Vec::new();
    let mut claimed = BTreeSet::new();
    // Kits a running build layers on keep their images until it settles.
    let platform = |id: &ArtifactId| {
        graph.get(id).map(|a| a.kit_type) == Some(KitType::Platform) && !in_flight.contains(id)
    };
    for leaf in graph.ids().filter(|id| graph.is_used(id) && platform(id)) {
        let mut chain = vec![leaf.clone()];
        let mut current = leaf;
        while let Some(parent) = graph.get(current).and_then(|a| a.base.as_ref()) {
            if !platform(parent)
                || graph.is_used(parent)
                || used_children(parent) != 1
                || chain.contains(parent)
            {
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
        if chain.len() < 2 {
            continue;
        }
        for member in &chain {
            if !claimed.insert(member.clone()) {
                return Err(GcError::Invariant(format!(
                    "kit {} belongs to two squash chains",
                    member
                )));
            }
        }
        chains.push(chain);
    }

    Ok(SquashPlan { chains })
}

/// Flatten every squashable chain.
///
/// The new image is written and read back before any kit or integration is
/// switched to it. A chain that fails is skipped and reported; the others
/// still proceed.
pub fn squash(
    graph: &mut ArtifactGraph,
    registry: &dyn Registry,
    dry_run: bool,
) -> Result<SquashOutcome, GcError> {
    let plan = plan_squash(graph)?;
    tracing::info!(dry_run, chains = plan.chains.len(), "squash planned");

    let mut outcome = SquashOutcome {
        dry_run,
        ..Default::default()
    };
    for members in plan.chains {
        let leaf = members[0].clone();
        let consumers = graph.consumers(&leaf);
        if dry_run {
            outcome.chains.push(SquashedChain {
                previous_image: graph.get(&leaf).and_then(|a| a.image.clone()),
                members,
                consumers,
                image: None,
                digest: None,
            });
            continue;
        }

        match squash_chain(graph, registry, &members) {
            Ok(flat) => {
                tracing::info!(
                    kit = %leaf,
                    members = members.len(),
                    image = %flat.image,
                    consumers = consumers.len(),
                    "chain squashed"
                );
                if delete_if_unreferenced(graph, registry, &flat.previous_image, &mut outcome.errors) {
                    outcome.deleted_images.push(flat.previous_image.clone());
                }
                outcome.chains.push(SquashedChain {
                    members,
                    consumers,
                    image: Some(flat.image),
                    digest: Some(flat.digest),
                    previous_image: Some(flat.previous_image),
                });
            }
            Err(ChainError::Graph(e)) => return Err(e.into()),
            Err(e) => {
                tracing::warn!(kit = %leaf, error = %e, "chain skipped");
                outcome.errors.push(format!("squash {}: {}", leaf, e));
            }
        }
    }

    Ok(outcome)
}

fn squash_chain(
    graph: &mut ArtifactGraph,
    registry: &dyn Registry,
    members: &[ArtifactId],
) -> Result<Flattened, ChainError> {
    let leaf_id = &members[0];
    let top_id = &members[members.len() - 1];
    let leaf = graph
        .get(leaf_id)
        .ok_or_else(|| GraphError::NotFound(leaf_id.clone()))?;
    let top = graph
        .get(top_id)
        .ok_or_else(|| GraphError::NotFound(top_id.clone()))?;

    let previous_image = leaf
        .image
        .clone()
        .ok_or_else(|| ChainError::NoImage(leaf_id.clone()))?;
    let (repository, _) = parse_reference(&previous_image)?;
    let repository = repository.to_string();
    let new_base = top.base.clone();
    let new_base_image = top.base_image.clone();

    let base = match &new_base_image {
        Some(reference) => registry.read_image(reference)?,
        None => ImageManifest::default(),
    };
    let current = registry.read_image(&previous_image)?;
    if !current.is_layered_on(&base) {
        return Err(ChainError::NotLayered {
            image: previous_image,
            base: new_base_image.unwrap_or_else(|| "scratch".to_string()),
        });
    }

    let delta = &current.layers[base.layers.len()..];
    let (Some(first), Some(last)) = (delta.first(), delta.last()) else {
        return Err(ChainError::NothingToFlatten(previous_image));
    };
    let layers = delta
        .iter()
        .map(|digest| registry.read_layer(digest))
        .collect::<Result<Vec<_>, _>>()?;
    let flat = flatten_layers(&layers);

    let mut manifest = base.clone();
    manifest.layers.push(registry.write_layer(&flat)?);
    manifest.history.push(format!(
        "Flattened Image layers {} through {} into a single layer",
        first, last
    ));
    manifest.labels = current.labels.clone();

    let digest = manifest.digest()?;
    let image = registry.write_image(&repository, &manifest)?;
    let actual = registry.read_image(&image)?.digest()?;
    if actual != digest {
        return Err(RegistryError::DigestMismatch {
            reference: image,
            expected: digest,
            actual,
        }
        .into());
    }

    graph.set_base(leaf_id, new_base, new_base_image)?;
    graph.set_image(leaf_id, Some(image.clone()), Some(digest.clone()))?;
    for child in graph.child_ids(leaf_id) {
        graph.set_base_image(&child, Some(image.clone()))?;
    }

    Ok(Flattened {
        image,
        digest,
        previous_image,
    })
}

fn delete_if_unreferenced(
    graph: &ArtifactGraph,
    registry: &dyn Registry,
    image: &str,
    errors: &mut Vec<String>,
) -> bool {
    let referenced = graph.iter().any(|a| {
        a.image.as_deref() == Some(image) || a.base_image.as_deref() == Some(image)
    });
    if referenced {
        return false;
    }
    match registry.delete_image(image) {
        Ok(()) => true,
        Err(RegistryError::ImageNotFound(_)) => false,
        Err(e) => {
            tracing::warn!(%image, error = %e, "old image deletion failed");
            errors.push(format!("delete image {}: {}", image, e));
            false
        }
    }
}
