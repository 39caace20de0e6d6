//! Human-readable GC reports.
//!
//! Pure formatting over [`PruneOutcome`] and [`SquashOutcome`]; the category
//! headings are stable and matched by scripts.

use std::fmt::Write;

use super::{PruneOutcome, SquashOutcome};
use crate::graph::ArtifactId;

pub const NOTHING_TO_DO: &str = "Nothing to do";
pub const ARTIFACTS_DELETED: &str = "The following Artifacts will be deleted";
pub const IMAGES_DELETED: &str = "The following Images will no longer be used and can be deleted";
pub const ARTIFACTS_SQUASHED: &str = "The following Artifacts will be squashed";
pub const INTEGRATIONS_REDEPLOYED: &str = "The following Integrations will be redeployed";

fn located(id: &ArtifactId) -> String {
    format!("{} in namespace: {}", id.name, id.namespace)
}

/// Plan of a prune, as shown before confirmation.
pub fn prune_plan(outcome: &PruneOutcome) -> String {
    if outcome.is_empty() {
        return format!("{}\n", NOTHING_TO_DO);
    }
    let mut out = String::new();
    if !outcome.artifacts.is_empty() {
        let _ = writeln!(out, "{}:", ARTIFACTS_DELETED);
        for id in &outcome.artifacts {
            let _ = writeln!(out, "{}", located(id));
        }
    }
    if !outcome.images.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "{}:", IMAGES_DELETED);
        for image in &outcome.images {
            let _ = writeln!(out, "{}", image);
        }
    }
    out
}

/// Plan of a squash, as shown before confirmation.
pub fn squash_plan(outcome: &SquashOutcome) -> String {
    if outcome.is_empty() {
        return format!("{}\n", NOTHING_TO_DO);
    }
    let mut out = String::new();
    let _ = writeln!(out, "{}:", ARTIFACTS_SQUASHED);
    for chain in &outcome.chains {
        for member in &chain.members {
            let _ = write!(out, "{}, ", located(member));
        }
        let _ = writeln!(out, "will all be squashed into Artifact: {}", located(chain.leaf()));
    }

    let redeployed = outcome.redeployed();
    if !redeployed.is_empty() {
        let _ = writeln!(out, "\n{}:", INTEGRATIONS_REDEPLOYED);
        for consumer in &redeployed {
            let _ = writeln!(out, "{}", located(consumer));
        }
    }
    out
}

/// What an applied prune did.
pub fn prune_summary(outcome: &PruneOutcome) -> String {
    let mut out = format!(
        "Deleted {} artifact(s) and {} image(s)\n",
        outcome.artifacts.len(),
        outcome.images.len()
    );
    for id in &outcome.kept {
        let _ = writeln!(out, "Kept {} (image deletion failed)", located(id));
    }
    for error in &outcome.errors {
        let _ = writeln!(out, "error: {}", error);
    }
    out
}

/// What an applied squash did.
pub fn squash_summary(outcome: &SquashOutcome) -> String {
    let mut out = format!(
        "Squashed {} chain(s), redeployed {} integration(s)\n",
        outcome.chains.len(),
        outcome.redeployed().len()
    );
    for chain in &outcome.chains {
        if let Some(image) = &chain.image {
            let _ = writeln!(out, "{} -> {}", located(chain.leaf()), image);
        }
    }
    for error in &outcome.errors {
        let _ = writeln!(out, "error: {}", error);
    }
    out
}
