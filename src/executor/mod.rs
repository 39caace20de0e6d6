//! Build executor interface
//!
//! Builds run out of process. The scheduler hands a [`LaunchSpec`] to the
//! executor and later receives a [`BuildEvent`] carrying the same execution
//! id; launching never blocks on the build itself.

pub mod mock;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use ulid::Ulid;

use crate::id::{ArtifactId, BuildId};

/// Launch errors reported synchronously by the executor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The builder could not be started right now (pod admission, quota).
    #[error("transient launch failure: {0}")]
    Transient(String),

    /// The build can never start (bad builder configuration).
    #[error("fatal launch failure: {0}")]
    Fatal(String),
}

/// Everything the executor needs to run one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub build: BuildId,
    pub execution_id: Ulid,
    /// 1-based attempt number.
    pub attempt: u32,
    pub kit: ArtifactId,
    pub dependencies: BTreeSet<String>,
    /// Dependencies to add on top of the base image.
    pub delta: BTreeSet<String>,
    pub build_properties: BTreeMap<String, String>,
    pub runtime_version: String,
    pub base_image: Option<String>,
    pub deadline: DateTime<Utc>,
}

/// Final result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded {
        image: String,
        digest: Option<String>,
    },
    Failed {
        reason: String,
        transient: bool,
    },
}

/// Completion notice for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEvent {
    pub build: BuildId,
    pub execution_id: Ulid,
    pub outcome: BuildOutcome,
}

impl BuildEvent {
    pub fn succeeded(spec: &LaunchSpec, image: impl Into<String>, digest: Option<String>) -> Self {
        Self {
            build: spec.build.clone(),
            execution_id: spec.execution_id,
            outcome: BuildOutcome::Succeeded {
                image: image.into(),
                digest,
            },
        }
    }

    pub fn failed(spec: &LaunchSpec, reason: impl Into<String>, transient: bool) -> Self {
        Self {
            build: spec.build.clone(),
            execution_id: spec.execution_id,
            outcome: BuildOutcome::Failed {
                reason: reason.into(),
                transient,
            },
        }
    }
}

/// Out-of-process build runner.
pub trait BuildExecutor: Send {
    /// Start an attempt. Must return without waiting for the build.
    fn launch(&mut self, spec: &LaunchSpec) -> Result<(), LaunchError>;

    /// Abandon an attempt (timeout or superseded). Best effort.
    fn cancel(&mut self, build: &BuildId, execution_id: Ulid);
}
