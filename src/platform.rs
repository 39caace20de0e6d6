//! Platform facade
//!
//! [`PlatformCore`] wires the graph store, compatibility gate, matcher,
//! scheduler and garbage collector of one platform together. It is driven by
//! an outer loop (see [`crate::control`]) and never blocks on a build.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

use kiln_api::{
    ApiError, Build, BuildFailure, BuildRequest, ErrorCode, FailureKind, Integration, Kit,
    KitPhase, KitType,
};

use crate::compat::{CatalogError, CatalogSource, CompatibilityGate};
use crate::config::PlatformSettings;
use crate::executor::{BuildEvent, BuildExecutor};
use crate::failure::ExitCode;
use crate::fingerprint::{fingerprint, FingerprintError, MatchError, MatchOutcome, Matcher};
use crate::gc::{self, GcError, PruneOutcome, PruneScope, SquashOutcome};
use crate::graph::{Artifact, ArtifactGraph, ArtifactId, ConsumerId, GraphError, GraphStore};
use crate::id::BuildId;
use crate::registry::{Registry, RegistryError};
use crate::scheduler::{BuildTask, Scheduler, SchedulerError, SchedulerUpdate};

/// Platform errors
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Gc(#[from] GcError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
}

impl PlatformError {
    fn code(&self) -> ErrorCode {
        match self {
            PlatformError::Match(MatchError::InvalidRequest(_)) => ErrorCode::InvalidRequest,
            PlatformError::Match(MatchError::Fingerprint(_)) | PlatformError::Fingerprint(_) => {
                ErrorCode::Internal
            }
            PlatformError::Catalog(_) => ErrorCode::CatalogUnavailable,
            PlatformError::Scheduler(e) => match e {
                SchedulerError::Duplicate(_) => ErrorCode::Duplicate,
                SchedulerError::NotFound(_) => ErrorCode::NotFound,
                SchedulerError::InFlight(_) => ErrorCode::BuildInProgress,
                SchedulerError::InvalidTransition { .. } => ErrorCode::Internal,
            },
            PlatformError::Graph(e) | PlatformError::Gc(GcError::Graph(e)) => graph_code(e),
            PlatformError::Gc(GcError::Invariant(_)) => ErrorCode::Internal,
            PlatformError::Registry(_) => ErrorCode::RegistryFailure,
        }
    }

    /// Error payload for the reconciliation layer.
    pub fn to_api_error(&self) -> ApiError {
        ApiError::new(self.code(), self.to_string())
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> ExitCode {
        match self.code() {
            ErrorCode::InvalidRequest | ErrorCode::Duplicate | ErrorCode::NotFound => {
                ExitCode::Usage
            }
            ErrorCode::RegistryFailure => ExitCode::Registry,
            ErrorCode::Internal => ExitCode::Internal,
            ErrorCode::IncompatibleCatalog
            | ErrorCode::BuildInProgress
            | ErrorCode::CatalogUnavailable => ExitCode::OperationFailed,
        }
    }
}

fn graph_code(e: &GraphError) -> ErrorCode {
    match e {
        GraphError::Duplicate(_) => ErrorCode::Duplicate,
        GraphError::NotFound(_) | GraphError::UnknownBase { .. } => ErrorCode::NotFound,
        GraphError::StillUsed { .. } => ErrorCode::InvalidRequest,
        GraphError::Cycle(_) => ErrorCode::Internal,
    }
}

/// What happened to a submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// An existing kit already satisfies the request.
    Reused { kit: ArtifactId },
    /// A new kit is being built.
    Queued {
        build: BuildId,
        kit: ArtifactId,
        base: Option<ArtifactId>,
    },
    /// The runtime catalog cannot build the request.
    Rejected {
        build: BuildId,
        failure: BuildFailure,
    },
}

impl Submission {
    pub fn kit(&self) -> Option<&ArtifactId> {
        match self {
            Submission::Reused { kit } | Submission::Queued { kit, .. } => Some(kit),
            Submission::Rejected { .. } => None,
        }
    }
}

/// A kit registered from an existing image rather than built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalKit {
    pub id: ArtifactId,
    pub image: String,
    pub dependencies: BTreeSet<String>,
    pub build_properties: BTreeMap<String, String>,
    pub runtime_version: String,
    pub base: Option<ArtifactId>,
    pub priority: i32,
}

/// One platform's build queue and kit graph.
pub struct PlatformCore {
    settings: PlatformSettings,
    graph: Arc<GraphStore>,
    gate: CompatibilityGate,
    matcher: Matcher,
    scheduler: Scheduler,
    registry: Arc<dyn Registry>,
    executor: Box<dyn BuildExecutor>,
    integrations: BTreeMap<ConsumerId, Integration>,
}

impl std::fmt::Debug for PlatformCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformCore")
            .field("settings", &self.settings)
            .field("scheduler", &self.scheduler)
            .field("integrations", &self.integrations.len())
            .finish_non_exhaustive()
    }
}

impl PlatformCore {
    pub fn new(
        settings: PlatformSettings,
        graph: ArtifactGraph,
        catalogs: Box<dyn CatalogSource>,
        registry: Arc<dyn Registry>,
        executor: Box<dyn BuildExecutor>,
    ) -> Self {
        let matcher = Matcher::new(
            settings.operator_version.clone(),
            settings.scheduler.order_strategy,
        );
        Self {
            scheduler: Scheduler::new(settings.scheduler.clone()),
            settings,
            graph: Arc::new(GraphStore::new(graph)),
            gate: CompatibilityGate::new(catalogs),
            matcher,
            registry,
            executor,
            integrations: BTreeMap::new(),
        }
    }

    pub fn settings(&self) -> &PlatformSettings {
        &self.settings
    }

    /// Shared handle for concurrent readers.
    pub fn graph(&self) -> Arc<GraphStore> {
        Arc::clone(&self.graph)
    }

    pub fn registry(&self) -> Arc<dyn Registry> {
        Arc::clone(&self.registry)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn gate_mut(&mut self) -> &mut CompatibilityGate {
        &mut self.gate
    }

    pub fn build(&self, id: &BuildId) -> Option<&Build> {
        self.scheduler.build(id)
    }

    pub fn builds(&self) -> impl Iterator<Item = &Build> {
        self.scheduler.builds()
    }

    pub fn kit(&self, id: &ArtifactId) -> Option<Kit> {
        self.graph.read(|g| g.kit(id))
    }

    pub fn kits(&self) -> Vec<Kit> {
        self.graph.read(|g| g.kits())
    }

    pub fn integration(&self, id: &ConsumerId) -> Option<&Integration> {
        self.integrations.get(id)
    }

    pub fn integrations(&self) -> impl Iterator<Item = &Integration> {
        self.integrations.values()
    }

    /// Resolve a request to an existing kit or queue a build for it.
    pub fn submit(
        &mut self,
        request: &BuildRequest,
        now: DateTime<Utc>,
    ) -> Result<Submission, PlatformError> {
        request.validate().map_err(MatchError::from)?;
        let build_id = BuildId::new(request.namespace.clone(), request.name.clone());
        if self.scheduler.build(&build_id).is_some() {
            return Err(SchedulerError::Duplicate(build_id).into());
        }

        let record = self.gate.check_compatible(&request.runtime_version, now)?;
        if !record.compatible {
            let fp = fingerprint(
                &request.dependencies,
                &request.build_properties,
                &request.runtime_version,
            )?;
            let kit = self.graph.read(|g| next_kit_id(g, &request.namespace, &fp));
            let failure = self.scheduler.reject(
                build_id.clone(),
                &kit,
                FailureKind::Incompatible,
                record.rejection_reason(),
                now,
            )?;
            return Ok(Submission::Rejected {
                build: build_id,
                failure,
            });
        }

        let mut request = request.clone();
        if !self.settings.incremental {
            request.strategy.incremental = false;
        }
        let (fp, outcome) = self.graph.read(|g| self.matcher.resolve(&request, g))?;

        let (task, base) = match outcome {
            MatchOutcome::Exact(kit) => {
                tracing::info!(build = %build_id, kit = %kit, "reusing kit");
                return Ok(Submission::Reused { kit });
            }
            MatchOutcome::Incremental { base, delta } => {
                let base_image = self.graph.read(|g| g.get(&base).and_then(|a| a.image.clone()));
                let parent_build = self.scheduler.build_for_kit(&base);
                let kit = self.graph.read(|g| next_kit_id(g, &request.namespace, &fp));
                let task = BuildTask::root(kit, &request, fp, None).on_base(
                    base.clone(),
                    base_image,
                    delta,
                    parent_build,
                );
                (task, Some(base))
            }
            MatchOutcome::Root => {
                let base_image = request
                    .strategy
                    .base_image
                    .clone()
                    .unwrap_or_else(|| self.settings.base_image.clone());
                let kit = self.graph.read(|g| next_kit_id(g, &request.namespace, &fp));
                (BuildTask::root(kit, &request, fp, Some(base_image)), None)
            }
        };

        let kit = task.kit.clone();
        self.graph.mutate(|g| {
            g.add_artifact(Artifact {
                id: kit.clone(),
                fingerprint: task.fingerprint.clone(),
                dependencies: task.dependencies.clone(),
                build_properties: task.build_properties.clone(),
                runtime_version: task.runtime_version.clone(),
                base: task.base_kit.clone(),
                base_image: task.base_image.clone(),
                image: None,
                digest: None,
                priority: request.priority,
                version: self.settings.operator_version.clone(),
                phase: KitPhase::Building,
                kit_type: KitType::Platform,
                created_at: now,
            })
        })?;
        self.scheduler.enqueue(build_id.clone(), task, now)?;
        self.schedule(now)?;

        Ok(Submission::Queued {
            build: build_id,
            kit,
            base,
        })
    }

    /// Register a kit for an already built image.
    pub fn create_external_kit(
        &mut self,
        kit: ExternalKit,
        now: DateTime<Utc>,
    ) -> Result<Kit, PlatformError> {
        kit.id.validate().map_err(MatchError::from)?;
        let fp = fingerprint(&kit.dependencies, &kit.build_properties, &kit.runtime_version)?;
        let digest = match self.registry.read_image(&kit.image) {
            Ok(manifest) => Some(manifest.digest()?),
            Err(RegistryError::ImageNotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let id = kit.id.clone();
        let operator_version = self.settings.operator_version.clone();

        self.graph.mutate(|g| -> Result<(), GraphError> {
            let base_image = match &kit.base {
                Some(base) => g
                    .get(base)
                    .ok_or_else(|| GraphError::UnknownBase {
                        id: kit.id.clone(),
                        base: base.clone(),
                    })?
                    .image
                    .clone(),
                None => None,
            };
            g.add_artifact(Artifact {
                id: kit.id,
                fingerprint: fp,
                dependencies: kit.dependencies,
                build_properties: kit.build_properties,
                runtime_version: kit.runtime_version,
                base: kit.base,
                base_image,
                image: Some(kit.image),
                digest,
                priority: kit.priority,
                version: operator_version,
                phase: KitPhase::Ready,
                kit_type: KitType::External,
                created_at: now,
            })
        })?;
        tracing::info!(kit = %id, "external kit registered");
        self.kit(&id).ok_or_else(|| GraphError::NotFound(id).into())
    }

    /// Feed a completion event from the executor.
    pub fn on_build_event(
        &mut self,
        event: BuildEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<SchedulerUpdate>, PlatformError> {
        let mut updates = self.scheduler.on_event(event, self.executor.as_mut(), now);
        self.apply(&updates)?;
        updates.extend(self.schedule(now)?);
        Ok(updates)
    }

    /// Expire timed-out attempts and admit pending builds.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<SchedulerUpdate>, PlatformError> {
        let updates = self.scheduler.tick(self.executor.as_mut(), now);
        self.apply(&updates)?;
        Ok(updates)
    }

    fn schedule(&mut self, now: DateTime<Utc>) -> Result<Vec<SchedulerUpdate>, PlatformError> {
        let updates = self.scheduler.schedule(self.executor.as_mut(), now);
        self.apply(&updates)?;
        Ok(updates)
    }

    fn apply(&mut self, updates: &[SchedulerUpdate]) -> Result<(), PlatformError> {
        for update in updates {
            match update {
                SchedulerUpdate::Succeeded {
                    kit,
                    image,
                    digest,
                    base_image,
                    ..
                } => self.graph.mutate(|g| -> Result<(), GraphError> {
                    g.set_image(kit, Some(image.clone()), digest.clone())?;
                    g.set_phase(kit, KitPhase::Ready)?;
                    if base_image.is_some() {
                        g.set_base_image(kit, base_image.clone())?;
                    }
                    for child in g.child_ids(kit) {
                        g.set_base_image(&child, Some(image.clone()))?;
                    }
                    Ok(())
                })?,
                SchedulerUpdate::Failed { kit, .. } => {
                    self.graph.mutate(|g| g.set_phase(kit, KitPhase::Error))?
                }
                SchedulerUpdate::Started { .. } | SchedulerUpdate::Retrying { .. } => {}
            }
        }
        Ok(())
    }

    /// Bind an integration to a kit, creating or moving it.
    pub fn bind_integration(
        &mut self,
        id: ConsumerId,
        kit: &ArtifactId,
    ) -> Result<&Integration, PlatformError> {
        let image = self.graph.mutate(|g| -> Result<Option<String>, GraphError> {
            g.bind_consumer(id.clone(), kit)?;
            Ok(g.get(kit).and_then(|a| a.image.clone()))
        })?;

        let integration = self
            .integrations
            .entry(id.clone())
            .or_insert_with(|| Integration::new(id.namespace.clone(), id.name.clone(), kit.name.clone()));
        if integration.kit != kit.name || integration.image != image {
            integration.redeploy(kit.name.clone(), image);
        }
        tracing::info!(integration = %id, kit = %kit, generation = integration.generation, "integration bound");
        Ok(integration)
    }

    /// Drop an integration; its kit may become prunable.
    pub fn unbind_integration(&mut self, id: &ConsumerId) -> Option<Integration> {
        let previous = self.graph.mutate(|g| g.unbind_consumer(id));
        if let Some(kit) = &previous {
            tracing::info!(integration = %id, kit = %kit, "integration unbound");
        }
        self.integrations.remove(id)
    }

    /// Restore integration records, binding each to its kit.
    pub fn restore_integrations<I>(&mut self, integrations: I) -> Result<(), PlatformError>
    where
        I: IntoIterator<Item = Integration>,
    {
        for integration in integrations {
            let id = ConsumerId::new(integration.namespace.clone(), integration.name.clone());
            let kit = ArtifactId::new(integration.namespace.clone(), integration.kit.clone());
            self.graph.mutate(|g| g.bind_consumer(id.clone(), &kit))?;
            self.integrations.insert(id, integration);
        }
        Ok(())
    }

    /// Delete kits no integration can reach.
    pub fn prune(&mut self, scope: PruneScope, dry_run: bool) -> Result<PruneOutcome, PlatformError> {
        let registry = Arc::clone(&self.registry);
        let outcome = self
            .graph
            .mutate(|g| gc::prune(g, registry.as_ref(), scope, dry_run))?;
        Ok(outcome)
    }

    /// Flatten straight lineages and redeploy their integrations.
    pub fn squash(&mut self, dry_run: bool) -> Result<SquashOutcome, PlatformError> {
        let registry = Arc::clone(&self.registry);
        let outcome = self
            .graph
            .mutate(|g| gc::squash(g, registry.as_ref(), dry_run))?;

        for chain in outcome.chains.iter().filter(|c| c.image.is_some()) {
            let leaf = chain.leaf();
            for consumer in &chain.consumers {
                let integration = self.integrations.entry(consumer.clone()).or_insert_with(|| {
                    Integration::new(consumer.namespace.clone(), consumer.name.clone(), leaf.name.clone())
                });
                integration.redeploy(leaf.name.clone(), chain.image.clone());
                tracing::info!(
                    integration = %consumer,
                    generation = integration.generation,
                    "integration redeployed"
                );
            }
        }
        Ok(outcome)
    }
}

/// First free kit name derived from a fingerprint.
fn next_kit_id(graph: &ArtifactGraph, namespace: &str, fingerprint: &str) -> ArtifactId {
    let stem = format!("kit-{}", &fingerprint[..fingerprint.len().min(12)]);
    let mut id = ArtifactId::new(namespace, stem.clone());
    let mut n = 1;
    while graph.contains(&id) {
        n += 1;
        id = ArtifactId::new(namespace, format!("{}-{}", stem, n));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::{CatalogSpec, StaticCatalogs};
    use crate::executor::mock::{simulate_build, RecordingExecutor};
    use crate::registry::{ImageManifest, InMemoryRegistry, Layer};
    use chrono::{Duration, TimeZone};
    use kiln_api::{BuildPhase, OrderStrategy};

    struct Harness {
        core: PlatformCore,
        exec: RecordingExecutor,
        registry: Arc<InMemoryRegistry>,
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn harness(strategy: OrderStrategy) -> Harness {
        let registry = Arc::new(InMemoryRegistry::new());
        let base_layer = registry
            .write_layer(&Layer::new().with_file("etc/os-release", "kiln"))
            .unwrap();
        let base_image = registry
            .write_image(
                "registry/base",
                &ImageManifest {
                    layers: vec![base_layer],
                    ..Default::default()
                },
            )
            .unwrap();

        let mut settings = PlatformSettings::default();
        settings.scheduler.order_strategy = strategy;
        settings.base_image = base_image;
        let catalogs = StaticCatalogs::new([
            CatalogSpec {
                runtime_version: "1.0".to_string(),
                container_image_tool: Some("builder:1.0".to_string()),
            },
            CatalogSpec {
                runtime_version: "2.0".to_string(),
                container_image_tool: None,
            },
        ]);
        let exec = RecordingExecutor::new();
        let core = PlatformCore::new(
            settings,
            ArtifactGraph::new(),
            Box::new(catalogs),
            registry.clone(),
            Box::new(exec.clone()),
        );
        Harness {
            core,
            exec,
            registry,
        }
    }

    fn request(name: &str, deps: &[&str]) -> BuildRequest {
        BuildRequest::new("default", name, "1.0").dependencies(deps.iter().copied())
    }

    impl Harness {
        fn complete(&mut self, build: &str, now: DateTime<Utc>) {
            let spec = self.exec.last_launch(&BuildId::new("default", build)).unwrap();
            let event = simulate_build(&spec, self.registry.as_ref(), "registry/kiln").unwrap();
            self.core.on_build_event(event, now).unwrap();
        }
    }

    #[test]
    fn test_root_then_incremental_then_reuse() {
        let mut h = harness(OrderStrategy::Fifo);
        let first = h.core.submit(&request("b1", &["camel:log"]), t(0)).unwrap();
        let Submission::Queued { kit: base_kit, base: None, .. } = first else {
            panic!("expected root build, got {:?}", first);
        };
        assert_eq!(h.core.kit(&base_kit).unwrap().phase, KitPhase::Building);
        assert_eq!(
            h.exec.last_launch(&BuildId::new("default", "b1")).unwrap().base_image.as_deref(),
            Some(h.core.settings().base_image.as_str())
        );

        h.complete("b1", t(1));
        let kit = h.core.kit(&base_kit).unwrap();
        assert_eq!(kit.phase, KitPhase::Ready);
        assert!(kit.image.is_some());
        assert_eq!(h.core.build(&BuildId::new("default", "b1")).unwrap().phase, BuildPhase::Succeeded);

        let second = h.core.submit(&request("b2", &["camel:log", "camel:http"]), t(2)).unwrap();
        let Submission::Queued { base, .. } = &second else {
            panic!("expected incremental build");
        };
        assert_eq!(base.as_ref(), Some(&base_kit));
        let spec = h.exec.last_launch(&BuildId::new("default", "b2")).unwrap();
        assert_eq!(spec.delta, BTreeSet::from(["camel:http".to_string()]));
        assert_eq!(spec.base_image, kit.image);

        let third = h.core.submit(&request("b3", &["camel:log"]), t(3)).unwrap();
        assert_eq!(third, Submission::Reused { kit: base_kit });
    }

    #[test]
    fn test_incompatible_runtime_rejected() {
        let mut h = harness(OrderStrategy::Fifo);
        let req = BuildRequest::new("default", "b1", "2.0").dependency("camel:log");
        let Submission::Rejected { failure, .. } = h.core.submit(&req, t(0)).unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(failure.kind, FailureKind::Incompatible);
        assert_eq!(
            failure.reason,
            "Catalog 2.0 error: Container image tool missing in catalog 2.0"
        );
        let build = h.core.build(&BuildId::new("default", "b1")).unwrap();
        assert_eq!(build.retries_used, 0);
        assert!(h.core.kits().is_empty());
        assert!(h.exec.launches().is_empty());

        let missing = BuildRequest::new("default", "b2", "9.9").dependency("camel:log");
        let Submission::Rejected { failure, .. } = h.core.submit(&missing, t(0)).unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(failure.reason, "Catalog 9.9 error: Catalog 9.9 not found");
    }

    #[test]
    fn test_invalid_and_duplicate_requests() {
        let mut h = harness(OrderStrategy::Fifo);
        let err = h.core.submit(&request("Bad_Name", &["x"]), t(0)).unwrap_err();
        assert_eq!(err.to_api_error().code, ErrorCode::InvalidRequest);
        assert_eq!(err.exit_code(), ExitCode::Usage);

        h.core.submit(&request("b1", &["x"]), t(0)).unwrap();
        let err = h.core.submit(&request("b1", &["y"]), t(0)).unwrap_err();
        assert_eq!(err.to_api_error().code, ErrorCode::Duplicate);
    }

    #[test]
    fn test_dependencies_child_builds_on_building_parent() {
        let mut h = harness(OrderStrategy::Dependencies);
        h.core.submit(&request("p", &["a"]), t(0)).unwrap();
        let child = h.core.submit(&request("c", &["a", "b"]), t(0)).unwrap();
        assert!(matches!(child, Submission::Queued { base: Some(_), .. }));
        assert_eq!(h.exec.start_order(), vec!["p"]);

        h.complete("p", t(1));
        assert_eq!(h.exec.start_order(), vec!["p", "c"]);
        let parent_image = h.core.build(&BuildId::new("default", "p")).unwrap().image.clone();
        let spec = h.exec.last_launch(&BuildId::new("default", "c")).unwrap();
        assert_eq!(spec.base_image, parent_image);

        h.complete("c", t(2));
        let kit = h.core.kit(child.kit().unwrap()).unwrap();
        assert_eq!(kit.base_image, parent_image);
        assert_eq!(kit.phase, KitPhase::Ready);
    }

    #[test]
    fn test_failed_parent_fails_child_kit() {
        let mut h = harness(OrderStrategy::Dependencies);
        h.core.submit(&request("p", &["a"]), t(0)).unwrap();
        let child = h.core.submit(&request("c", &["a", "b"]), t(0)).unwrap();
        let spec = h.exec.last_launch(&BuildId::new("default", "p")).unwrap();
        h.core
            .on_build_event(BuildEvent::failed(&spec, "compilation failed", false), t(1))
            .unwrap();

        let build = h.core.build(&BuildId::new("default", "c")).unwrap();
        assert_eq!(build.failure.as_ref().unwrap().kind, FailureKind::BaseFailed);
        assert_eq!(h.core.kit(child.kit().unwrap()).unwrap().phase, KitPhase::Error);
        assert!(h.core.prune(PruneScope::Lineage, true).is_ok());
    }

    #[test]
    fn test_gc_runs_alongside_builds() {
        let mut h = harness(OrderStrategy::Fifo);
        let base = h.core.submit(&request("ba", &["a"]), t(0)).unwrap();
        h.complete("ba", t(1));
        let stray = h.core.submit(&request("bs", &["s"]), t(2)).unwrap();
        h.complete("bs", t(3));

        // An incremental build on `ba` is in flight.
        let child = h.core.submit(&request("bc", &["a", "c"]), t(4)).unwrap();
        assert!(matches!(&child, Submission::Queued { base: Some(b), .. } if Some(b) == base.kit()));
        assert_eq!(h.core.kit(child.kit().unwrap()).unwrap().phase, KitPhase::Building);

        let pruned = h.core.prune(PruneScope::Unreferenced, false).unwrap();
        assert_eq!(pruned.artifacts, vec![stray.kit().unwrap().clone()]);
        assert!(h.core.kit(base.kit().unwrap()).is_some());
        assert!(h.core.squash(true).unwrap().is_empty());

        h.complete("bc", t(5));
        let settled = h.core.prune(PruneScope::Unreferenced, true).unwrap();
        assert_eq!(settled.artifacts.len(), 2);
    }

    #[test]
    fn test_squash_redeploys_integrations() {
        let mut h = harness(OrderStrategy::Fifo);
        let a = h.core.submit(&request("ba", &["a"]), t(0)).unwrap();
        h.complete("ba", t(1));
        let b = h.core.submit(&request("bb", &["a", "b"]), t(2)).unwrap();
        h.complete("bb", t(3));

        let consumer = ConsumerId::new("default", "route");
        let leaf = b.kit().unwrap().clone();
        let bound = h.core.bind_integration(consumer.clone(), &leaf).unwrap().clone();
        assert_eq!(bound.generation, 1);

        let outcome = h.core.squash(false).unwrap();
        assert_eq!(outcome.chains.len(), 1);
        assert_eq!(outcome.chains[0].members, vec![leaf.clone(), a.kit().unwrap().clone()]);

        let integration = h.core.integration(&consumer).unwrap();
        assert_eq!(integration.generation, 2);
        assert_eq!(integration.image, h.core.kit(&leaf).unwrap().image);
        assert_ne!(integration.image, bound.image);

        let pruned = h.core.prune(PruneScope::Lineage, false).unwrap();
        assert_eq!(pruned.artifacts, vec![a.kit().unwrap().clone()]);
    }

    #[test]
    fn test_external_kit_and_unbind() {
        let mut h = harness(OrderStrategy::Fifo);
        let id = ArtifactId::new("default", "ext");
        let kit = h
            .core
            .create_external_kit(
                ExternalKit {
                    id: id.clone(),
                    image: "quay.io/acme/ext:1".to_string(),
                    dependencies: BTreeSet::from(["camel:log".to_string()]),
                    build_properties: BTreeMap::new(),
                    runtime_version: "1.0".to_string(),
                    base: None,
                    priority: 0,
                },
                t(0),
            )
            .unwrap();
        assert_eq!(kit.kit_type, KitType::External);
        assert_eq!(kit.phase, KitPhase::Ready);
        assert_eq!(kit.digest, None);

        // External kits are never matched for reuse.
        let sub = h.core.submit(&request("b1", &["camel:log"]), t(1)).unwrap();
        assert!(matches!(sub, Submission::Queued { .. }));

        let consumer = ConsumerId::new("default", "i1");
        h.core.bind_integration(consumer.clone(), &id).unwrap();
        assert!(h.core.kit(&id).unwrap().used);
        assert!(h.core.unbind_integration(&consumer).is_some());
        assert!(!h.core.kit(&id).unwrap().used);
    }

    #[test]
    fn test_timeouts_surface_on_kit() {
        let mut h = harness(OrderStrategy::Fifo);
        let sub = h.core.submit(&request("b1", &["x"]), t(0)).unwrap();
        let mut now = 0;
        for _ in 0..5 {
            now += 301;
            h.core.tick(t(now)).unwrap();
        }
        let build = h.core.build(&BuildId::new("default", "b1")).unwrap();
        assert_eq!(build.phase, BuildPhase::Error);
        assert_eq!(build.failure.as_ref().unwrap().reason, "build retries exhausted");
        assert_eq!(h.core.kit(sub.kit().unwrap()).unwrap().phase, KitPhase::Error);
    }
}
