//! Build scheduler
//!
//! Admits builds into a bounded set of running slots under one of three
//! ordering policies, launches them on an out-of-process executor, and
//! tracks completion events, timeouts and retries.
//!
//! - `Sequential`: one build at a time, arrival order.
//! - `Fifo`: arrival order under `max_running_builds`; the head of the
//!   queue blocks everything behind it.
//! - `Dependencies`: a build whose incremental base is still being built
//!   waits for it; other builds start in arrival order.
//!
//! Nothing here blocks on a build. All time is passed in by the caller.

mod queue;
pub mod state;
pub mod timeout;

pub use queue::{BuildQueue, QueueEntry};
pub use timeout::{AttemptTimer, TimeoutStatus, TimeoutValidationError};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use ulid::Ulid;

use kiln_api::{Build, BuildFailure, BuildPhase, BuildRequest, ConditionKind, FailureKind, OrderStrategy, PlatformConfig};

use crate::executor::{BuildEvent, BuildExecutor, BuildOutcome, LaunchError, LaunchSpec};
use crate::id::{ArtifactId, BuildId};

/// Reason recorded when transient failures used up the retry budget.
pub const RETRIES_EXHAUSTED: &str = "build retries exhausted";

/// Scheduler errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("build {0} already exists")]
    Duplicate(BuildId),

    #[error("build {0} not found")]
    NotFound(BuildId),

    #[error("build {0} is still in flight")]
    InFlight(BuildId),

    #[error("invalid transition of build {build} from {from} to {to}")]
    InvalidTransition {
        build: String,
        from: BuildPhase,
        to: BuildPhase,
    },
}

/// What to build for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub kit: ArtifactId,
    pub fingerprint: String,
    pub dependencies: BTreeSet<String>,
    pub build_properties: BTreeMap<String, String>,
    pub runtime_version: String,
    /// Dependencies to add on top of the base image.
    pub delta: BTreeSet<String>,
    pub base_kit: Option<ArtifactId>,
    /// Known once the base kit has an image.
    pub base_image: Option<String>,
    /// Build producing `base_kit`, while it is in flight.
    pub parent_build: Option<BuildId>,
}

impl BuildTask {
    /// Full build of `request` on `base_image`.
    pub fn root(
        kit: ArtifactId,
        request: &BuildRequest,
        fingerprint: impl Into<String>,
        base_image: Option<String>,
    ) -> Self {
        Self {
            kit,
            fingerprint: fingerprint.into(),
            dependencies: request.dependencies.clone(),
            build_properties: request.build_properties.clone(),
            runtime_version: request.runtime_version.clone(),
            delta: request.dependencies.clone(),
            base_kit: None,
            base_image,
            parent_build: None,
        }
    }

    /// Layer only `delta` on top of `base_kit`.
    pub fn on_base(
        mut self,
        base_kit: ArtifactId,
        base_image: Option<String>,
        delta: BTreeSet<String>,
        parent_build: Option<BuildId>,
    ) -> Self {
        self.base_kit = Some(base_kit);
        self.base_image = base_image;
        self.delta = delta;
        self.parent_build = parent_build;
        self
    }
}

/// State change reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerUpdate {
    Started {
        build: BuildId,
        attempt: u32,
        execution_id: Ulid,
    },
    Retrying {
        build: BuildId,
        retries_used: u32,
        reason: String,
    },
    Succeeded {
        build: BuildId,
        kit: ArtifactId,
        image: String,
        digest: Option<String>,
        base_image: Option<String>,
    },
    Failed {
        build: BuildId,
        kit: ArtifactId,
        failure: BuildFailure,
    },
}

#[derive(Debug, Clone)]
struct Attempt {
    task: BuildTask,
    execution_id: Ulid,
    attempt: u32,
    timer: AttemptTimer,
}

/// Bounded-concurrency build scheduler for one platform.
#[derive(Debug)]
pub struct Scheduler {
    config: PlatformConfig,
    queue: BuildQueue,
    running: BTreeMap<BuildId, Attempt>,
    builds: BTreeMap<BuildId, Build>,
    next_arrival: u64,
}

impl Scheduler {
    pub fn new(config: PlatformConfig) -> Self {
        Self {
            config,
            queue: BuildQueue::new(),
            running: BTreeMap::new(),
            builds: BTreeMap::new(),
            next_arrival: 0,
        }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Replace the configuration; running builds keep their deadlines.
    pub fn set_config(&mut self, config: PlatformConfig) {
        self.config = config;
    }

    pub fn build(&self, id: &BuildId) -> Option<&Build> {
        self.builds.get(id)
    }

    /// Every known build, in id order.
    pub fn builds(&self) -> impl Iterator<Item = &Build> {
        self.builds.values()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn running_ids(&self) -> Vec<BuildId> {
        self.running.keys().cloned().collect()
    }

    /// No build pending or running.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    /// Whether `id` is pending or running.
    pub fn in_flight(&self, id: &BuildId) -> bool {
        self.queue.contains(id) || self.running.contains_key(id)
    }

    /// In-flight build producing `kit`, if any.
    pub fn build_for_kit(&self, kit: &ArtifactId) -> Option<BuildId> {
        self.queue
            .iter()
            .find(|e| &e.task.kit == kit)
            .map(|e| e.id.clone())
            .or_else(|| {
                self.running
                    .iter()
                    .find(|(_, a)| &a.task.kit == kit)
                    .map(|(id, _)| id.clone())
            })
    }

    /// Execution id of the current attempt of a running build.
    pub fn execution_id(&self, id: &BuildId) -> Option<Ulid> {
        self.running.get(id).map(|a| a.execution_id)
    }

    /// Deadline of the current attempt of a running build.
    pub fn deadline(&self, id: &BuildId) -> Option<DateTime<Utc>> {
        self.running.get(id).map(|a| a.timer.deadline())
    }

    /// Add a build to the pending queue.
    pub fn enqueue(
        &mut self,
        id: BuildId,
        task: BuildTask,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        if self.builds.contains_key(&id) {
            return Err(SchedulerError::Duplicate(id));
        }

        let mut build = Build::pending(id.namespace.clone(), id.name.clone(), task.kit.name.clone());
        build.base_kit = task.base_kit.as_ref().map(|b| b.name.clone());
        build.base_image = task.base_image.clone();
        build.set_condition(
            ConditionKind::Scheduled,
            false,
            "Waiting",
            "build queued",
            now,
        );
        self.builds.insert(id.clone(), build);

        let arrival = self.next_arrival;
        self.next_arrival += 1;
        tracing::info!(
            build = %id,
            kit = %task.kit,
            arrival,
            base = ?task.base_kit.as_ref().map(ToString::to_string),
            phase = %BuildPhase::Pending,
            "build enqueued"
        );
        self.queue.push(QueueEntry { id, arrival, task });
        Ok(())
    }

    /// Record a build that fails before admission. It consumes no retries.
    pub fn reject(
        &mut self,
        id: BuildId,
        kit: &ArtifactId,
        kind: FailureKind,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<BuildFailure, SchedulerError> {
        if self.builds.contains_key(&id) {
            return Err(SchedulerError::Duplicate(id));
        }
        let mut build = Build::pending(id.namespace.clone(), id.name.clone(), kit.name.clone());
        let failure = state::fail(&mut build, kind, reason, now)?;
        tracing::info!(build = %id, kind = %kind, reason = %failure.reason, phase = %BuildPhase::Error, "build rejected");
        self.builds.insert(id, build);
        Ok(failure)
    }

    /// Drop the record of a finished build.
    pub fn forget(&mut self, id: &BuildId) -> Result<Build, SchedulerError> {
        if self.in_flight(id) {
            return Err(SchedulerError::InFlight(id.clone()));
        }
        self.builds
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))
    }

    /// Admit as many pending builds as the policy and free slots allow.
    pub fn schedule(
        &mut self,
        executor: &mut dyn BuildExecutor,
        now: DateTime<Utc>,
    ) -> Vec<SchedulerUpdate> {
        let mut updates = Vec::new();
        let slots = self.config.effective_slots();
        let strategy = self.config.order_strategy;
        loop {
            self.fail_orphans(now, &mut updates);
            if self.running.len() >= slots {
                break;
            }
            let next = {
                let running = &self.running;
                let ordered = self.queue.ordered(|id| running.contains_key(id));
                match strategy {
                    OrderStrategy::Dependencies => ordered
                        .into_iter()
                        .find(|(rank, _)| *rank == 0)
                        .map(|(_, e)| e.id.clone()),
                    OrderStrategy::Fifo | OrderStrategy::Sequential => self
                        .queue
                        .iter()
                        .next()
                        .filter(|head| {
                            ordered
                                .iter()
                                .any(|(rank, e)| e.id == head.id && *rank == 0)
                        })
                        .map(|e| e.id.clone()),
                }
            };
            let Some(id) = next else { break };
            let Some(entry) = self.queue.remove(&id) else { break };
            self.admit(entry, executor, now, &mut updates);
        }

        self.mark_waiting(slots, now);
        updates
    }

    /// Handle a completion event from the executor.
    ///
    /// Events for unknown builds or superseded attempts are ignored.
    pub fn on_event(
        &mut self,
        event: BuildEvent,
        executor: &mut dyn BuildExecutor,
        now: DateTime<Utc>,
    ) -> Vec<SchedulerUpdate> {
        let mut updates = Vec::new();
        let current = self.running.get(&event.build).map(|a| a.execution_id);
        if current != Some(event.execution_id) {
            tracing::debug!(
                build = %event.build,
                execution_id = %event.execution_id,
                "ignoring event from stale or unknown attempt"
            );
            return updates;
        }
        let Some(attempt) = self.running.remove(&event.build) else {
            return updates;
        };

        match event.outcome {
            BuildOutcome::Succeeded { image, digest } => {
                self.succeed(event.build, attempt, image, digest, now, &mut updates);
            }
            BuildOutcome::Failed {
                reason,
                transient: true,
            } => {
                tracing::warn!(build = %event.build, attempt = attempt.attempt, %reason, "transient build failure");
                self.retry_or_fail(event.build, attempt.task, attempt.attempt, reason, executor, now, &mut updates);
            }
            BuildOutcome::Failed {
                reason,
                transient: false,
            } => {
                self.finish_failed(event.build, attempt.task.kit, FailureKind::Fatal, reason, now, &mut updates);
            }
        }
        updates
    }

    /// Expire attempts past their deadline, then admit more work.
    pub fn tick(
        &mut self,
        executor: &mut dyn BuildExecutor,
        now: DateTime<Utc>,
    ) -> Vec<SchedulerUpdate> {
        let mut updates = Vec::new();
        let expired: Vec<BuildId> = self
            .running
            .iter()
            .filter(|(_, a)| a.timer.check(now).is_timeout())
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            let Some(attempt) = self.running.remove(&id) else {
                continue;
            };
            executor.cancel(&id, attempt.execution_id);
            let reason = format!(
                "build attempt {} timed out after {}s",
                attempt.attempt, self.config.build_timeout_seconds
            );
            tracing::warn!(build = %id, attempt = attempt.attempt, deadline = %attempt.timer.deadline(), "build attempt timed out");
            self.retry_or_fail(id, attempt.task, attempt.attempt, reason, executor, now, &mut updates);
        }

        updates.extend(self.schedule(executor, now));
        updates
    }

    /// Pending entries whose parent build failed can never start.
    fn fail_orphans(&mut self, now: DateTime<Utc>, updates: &mut Vec<SchedulerUpdate>) {
        let orphans: Vec<(BuildId, BuildId)> = self
            .queue
            .iter()
            .filter_map(|e| {
                let parent = e.task.parent_build.as_ref()?;
                let failed = self
                    .builds
                    .get(parent)
                    .map(|b| b.phase == BuildPhase::Error)
                    .unwrap_or(false);
                failed.then(|| (e.id.clone(), parent.clone()))
            })
            .collect();

        for (id, parent) in orphans {
            if let Some(entry) = self.queue.remove(&id) {
                let reason = format!("incremental base build {} failed", parent);
                self.finish_failed(id, entry.task.kit, FailureKind::BaseFailed, reason, now, updates);
            }
        }
    }

    fn admit(
        &mut self,
        entry: QueueEntry,
        executor: &mut dyn BuildExecutor,
        now: DateTime<Utc>,
        updates: &mut Vec<SchedulerUpdate>,
    ) {
        let QueueEntry { id, task, .. } = entry;
        if let Some(build) = self.builds.get_mut(&id) {
            if let Err(e) = state::transition(build, BuildPhase::Running) {
                tracing::error!(build = %id, error = %e, "cannot admit build");
                self.abandon(id, task.kit, e.to_string(), now, updates);
                return;
            }
            build.started_at.get_or_insert(now);
            build.base_image = task.base_image.clone();
            build.set_condition(ConditionKind::Scheduled, true, "Ready", "build admitted", now);
        }
        tracing::info!(build = %id, kit = %task.kit, phase = %BuildPhase::Running, "build admitted");
        self.launch(id, task, 1, executor, now, updates);
    }

    /// Launch one attempt, retrying transient launch errors in the same slot.
    fn launch(
        &mut self,
        id: BuildId,
        task: BuildTask,
        attempt: u32,
        executor: &mut dyn BuildExecutor,
        now: DateTime<Utc>,
        updates: &mut Vec<SchedulerUpdate>,
    ) {
        let timer = AttemptTimer::start(now, self.config.build_timeout_seconds);
        let spec = LaunchSpec {
            build: id.clone(),
            execution_id: Ulid::new(),
            attempt,
            kit: task.kit.clone(),
            dependencies: task.dependencies.clone(),
            delta: task.delta.clone(),
            build_properties: task.build_properties.clone(),
            runtime_version: task.runtime_version.clone(),
            base_image: task.base_image.clone(),
            deadline: timer.deadline(),
        };

        match executor.launch(&spec) {
            Ok(()) => {
                tracing::debug!(build = %id, attempt, execution_id = %spec.execution_id, "attempt launched");
                updates.push(SchedulerUpdate::Started {
                    build: id.clone(),
                    attempt,
                    execution_id: spec.execution_id,
                });
                self.running.insert(
                    id,
                    Attempt {
                        task,
                        execution_id: spec.execution_id,
                        attempt,
                        timer,
                    },
                );
            }
            Err(LaunchError::Transient(reason)) => {
                tracing::warn!(build = %id, attempt, %reason, "transient launch failure");
                self.retry_or_fail(id, task, attempt, reason, executor, now, updates);
            }
            Err(LaunchError::Fatal(reason)) => {
                self.finish_failed(id, task.kit, FailureKind::Fatal, reason, now, updates);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn retry_or_fail(
        &mut self,
        id: BuildId,
        task: BuildTask,
        attempt: u32,
        reason: String,
        executor: &mut dyn BuildExecutor,
        now: DateTime<Utc>,
        updates: &mut Vec<SchedulerUpdate>,
    ) {
        let max_retries = self.config.max_retries;
        let retries_used = match self.builds.get_mut(&id) {
            Some(build) => {
                build.retries_used += 1;
                build.retries_used
            }
            None => return,
        };

        if retries_used >= max_retries {
            tracing::warn!(build = %id, retries_used, last_error = %reason, "retry budget exhausted");
            self.finish_failed(id, task.kit, FailureKind::RetriesExhausted, RETRIES_EXHAUSTED, now, updates);
            return;
        }

        if let Some(build) = self.builds.get_mut(&id) {
            if let Err(e) = state::transition(build, BuildPhase::Running) {
                tracing::error!(build = %id, error = %e, "cannot retry build");
                self.abandon(id, task.kit, e.to_string(), now, updates);
                return;
            }
        }
        tracing::info!(build = %id, retries_used, max_retries, phase = %BuildPhase::Running, "retrying build");
        updates.push(SchedulerUpdate::Retrying {
            build: id.clone(),
            retries_used,
            reason,
        });
        self.launch(id, task, attempt + 1, executor, now, updates);
    }

    fn succeed(
        &mut self,
        id: BuildId,
        attempt: Attempt,
        image: String,
        digest: Option<String>,
        now: DateTime<Utc>,
        updates: &mut Vec<SchedulerUpdate>,
    ) {
        if let Some(build) = self.builds.get_mut(&id) {
            if let Err(e) = state::transition(build, BuildPhase::Succeeded) {
                tracing::error!(build = %id, error = %e, "cannot complete build");
                return;
            }
            build.image = Some(image.clone());
            build.completed_at = Some(now);
        }
        tracing::info!(build = %id, kit = %attempt.task.kit, %image, attempt = attempt.attempt, phase = %BuildPhase::Succeeded, "build succeeded");

        for entry in self.queue.iter_mut() {
            if entry.task.parent_build.as_ref() == Some(&id) {
                entry.task.base_image = Some(image.clone());
                if let Some(child) = self.builds.get_mut(&entry.id) {
                    child.base_image = Some(image.clone());
                }
            }
        }

        updates.push(SchedulerUpdate::Succeeded {
            build: id,
            kit: attempt.task.kit,
            image,
            digest,
            base_image: attempt.task.base_image,
        });
    }

    fn finish_failed(
        &mut self,
        id: BuildId,
        kit: ArtifactId,
        kind: FailureKind,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        updates: &mut Vec<SchedulerUpdate>,
    ) {
        let Some(build) = self.builds.get_mut(&id) else {
            return;
        };
        match state::fail(build, kind, reason, now) {
            Ok(failure) => {
                tracing::info!(build = %id, kind = %kind, reason = %failure.reason, phase = %BuildPhase::Error, "build failed");
                updates.push(SchedulerUpdate::Failed {
                    build: id,
                    kit,
                    failure,
                });
            }
            Err(e) => tracing::error!(build = %id, error = %e, "cannot fail build"),
        }
    }

    /// Fail a build whose record rejected a legal scheduler step.
    ///
    /// The build is forced to Error so that its kit does not stay Building.
    fn abandon(
        &mut self,
        id: BuildId,
        kit: ArtifactId,
        reason: String,
        now: DateTime<Utc>,
        updates: &mut Vec<SchedulerUpdate>,
    ) {
        let failure = BuildFailure {
            kind: FailureKind::Fatal,
            reason,
            recorded_at: now,
        };
        if let Some(build) = self.builds.get_mut(&id) {
            build.phase = BuildPhase::Error;
            build.failure = Some(failure.clone());
            build.completed_at = Some(now);
        }
        updates.push(SchedulerUpdate::Failed {
            build: id,
            kit,
            failure,
        });
    }

    /// Refresh the Scheduled condition of every pending build.
    fn mark_waiting(&mut self, slots: usize, now: DateTime<Utc>) {
        let running = &self.running;
        let ranks = self.queue.ranks(|id| running.contains_key(id));
        let full = self.running.len() >= slots;
        let limit = if slots == usize::MAX {
            "unbounded".to_string()
        } else {
            slots.to_string()
        };

        for entry in self.queue.iter() {
            let rank = ranks.get(&entry.id).copied().unwrap_or(0);
            let message = match (&entry.task.parent_build, rank) {
                (Some(parent), r) if r > 0 => format!("waiting for base build {}", parent),
                _ if full => format!(
                    "waiting for a free build slot ({} running, max {})",
                    self.running.len(),
                    limit
                ),
                _ => "waiting for earlier builds".to_string(),
            };
            if let Some(build) = self.builds.get_mut(&entry.id) {
                build.set_condition(ConditionKind::Scheduled, false, "Waiting", message, now);
            }
        }
    }
}
