//! Kiln - build queue and kit dependency graph manager
//!
//! This crate decides whether a requested dependency set can reuse an
//! existing kit, schedules the builds of new kits on an out-of-process
//! executor, and garbage-collects the resulting artifact graph by pruning
//! unreachable kits and squashing straight lineages.

pub mod compat;
pub mod config;
pub mod control;
pub mod executor;
pub mod failure;
pub mod fingerprint;
pub mod gc;
pub mod graph;
pub mod id;
pub mod platform;
pub mod registry;
pub mod scheduler;
pub mod snapshot;

pub use compat::{CatalogSource, CatalogSpec, CompatibilityGate, StaticCatalogs};
pub use config::{EffectiveConfig, PlatformSettings};
pub use control::{ControlHandle, ControlLoop};
pub use executor::{BuildEvent, BuildExecutor, LaunchSpec};
pub use failure::ExitCode;
pub use fingerprint::{fingerprint, MatchOutcome, Matcher};
pub use gc::{PruneOutcome, PruneScope, SquashOutcome};
pub use graph::{Artifact, ArtifactGraph, ArtifactId, ConsumerId, GraphStore, TreeFixture};
pub use platform::{ExternalKit, PlatformCore, PlatformError, Submission};
pub use registry::{InMemoryRegistry, Registry};
pub use scheduler::{Scheduler, SchedulerUpdate};
pub use snapshot::StateFile;

/// Version recorded on every kit this operator builds.
pub const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");
