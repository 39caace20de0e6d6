//! Control loop
//!
//! One thread owns the [`PlatformCore`] and is the only writer of its graph.
//! Callers talk to it through a [`ControlHandle`]; every command carries its
//! own reply channel. The loop also ticks the scheduler once per tick
//! interval, however busy the channel is, so that expired attempts are
//! retried without outside help.

use chrono::{DateTime, Utc};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use kiln_api::{Build, BuildRequest, Kit};

use crate::executor::BuildEvent;
use crate::gc::{PruneOutcome, PruneScope, SquashOutcome};
use crate::graph::GraphStore;
use crate::id::BuildId;
use crate::platform::{PlatformCore, PlatformError, Submission};
use crate::scheduler::SchedulerUpdate;

/// Control loop errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control loop has stopped")]
    Stopped,

    #[error("control loop thread panicked")]
    Panicked,

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

type Reply<T> = Sender<Result<T, PlatformError>>;

/// Work for the control loop.
#[derive(Debug)]
pub enum Command {
    Submit {
        request: BuildRequest,
        now: DateTime<Utc>,
        reply: Reply<Submission>,
    },
    BuildEvent {
        event: BuildEvent,
        now: DateTime<Utc>,
        reply: Reply<Vec<SchedulerUpdate>>,
    },
    Tick {
        now: DateTime<Utc>,
        reply: Reply<Vec<SchedulerUpdate>>,
    },
    Prune {
        scope: PruneScope,
        dry_run: bool,
        reply: Reply<PruneOutcome>,
    },
    Squash {
        dry_run: bool,
        reply: Reply<SquashOutcome>,
    },
    Build {
        id: BuildId,
        reply: Sender<Option<Build>>,
    },
    Shutdown,
}

/// The loop itself. Use [`ControlLoop::spawn`] to run it.
pub struct ControlLoop {
    core: PlatformCore,
    commands: Receiver<Command>,
    tick_interval: Duration,
}

impl ControlLoop {
    /// Start the loop on its own thread.
    pub fn spawn(core: PlatformCore, tick_interval: Duration) -> ControlHandle {
        let (tx, rx) = mpsc::channel();
        let graph = core.graph();
        let control = ControlLoop {
            core,
            commands: rx,
            tick_interval,
        };
        let thread = thread::Builder::new()
            .name("kiln-control".to_string())
            .spawn(move || control.run());

        match thread {
            Ok(join) => ControlHandle {
                commands: tx,
                graph,
                join: Some(join),
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn control loop");
                ControlHandle {
                    commands: tx,
                    graph,
                    join: None,
                }
            }
        }
    }

    fn run(mut self) -> PlatformCore {
        tracing::info!(tick_ms = self.tick_interval.as_millis() as u64, "control loop started");
        let mut next_tick = Instant::now() + self.tick_interval;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match self.commands.recv_timeout(wait) {
                Ok(Command::Shutdown) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            // A steady command stream must not starve deadline processing.
            if Instant::now() >= next_tick {
                if let Err(e) = self.core.tick(Utc::now()) {
                    tracing::error!(error = %e, "periodic tick failed");
                }
                next_tick = Instant::now() + self.tick_interval;
            }
        }
        tracing::info!("control loop stopped");
        self.core
    }

    fn handle(&mut self, command: Command) {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::Submit {
                request,
                now,
                reply,
            } => {
                let _ = reply.send(self.core.submit(&request, now));
            }
            Command::BuildEvent { event, now, reply } => {
                let _ = reply.send(self.core.on_build_event(event, now));
            }
            Command::Tick { now, reply } => {
                let _ = reply.send(self.core.tick(now));
            }
            Command::Prune {
                scope,
                dry_run,
                reply,
            } => {
                let _ = reply.send(self.core.prune(scope, dry_run));
            }
            Command::Squash { dry_run, reply } => {
                let _ = reply.send(self.core.squash(dry_run));
            }
            Command::Build { id, reply } => {
                let _ = reply.send(self.core.build(&id).cloned());
            }
            Command::Shutdown => {}
        }
    }
}

/// Client side of a running [`ControlLoop`].
pub struct ControlHandle {
    commands: Sender<Command>,
    graph: Arc<GraphStore>,
    join: Option<JoinHandle<PlatformCore>>,
}

impl ControlHandle {
    fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ControlError> {
        let (tx, rx) = mpsc::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| ControlError::Stopped)?;
        Ok(rx.recv().map_err(|_| ControlError::Stopped)??)
    }

    pub fn submit(&self, request: BuildRequest, now: DateTime<Utc>) -> Result<Submission, ControlError> {
        self.call(|reply| Command::Submit {
            request,
            now,
            reply,
        })
    }

    pub fn build_event(
        &self,
        event: BuildEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<SchedulerUpdate>, ControlError> {
        self.call(|reply| Command::BuildEvent { event, now, reply })
    }

    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<SchedulerUpdate>, ControlError> {
        self.call(|reply| Command::Tick { now, reply })
    }

    pub fn prune(&self, scope: PruneScope, dry_run: bool) -> Result<PruneOutcome, ControlError> {
        self.call(|reply| Command::Prune {
            scope,
            dry_run,
            reply,
        })
    }

    pub fn squash(&self, dry_run: bool) -> Result<SquashOutcome, ControlError> {
        self.call(|reply| Command::Squash { dry_run, reply })
    }

    pub fn build(&self, id: &BuildId) -> Result<Option<Build>, ControlError> {
        let (tx, rx) = mpsc::channel();
        self.commands
            .send(Command::Build {
                id: id.clone(),
                reply: tx,
            })
            .map_err(|_| ControlError::Stopped)?;
        rx.recv().map_err(|_| ControlError::Stopped)
    }

    /// Consistent read of the kits, without going through the loop.
    pub fn kits(&self) -> Vec<Kit> {
        self.graph.read(|g| g.kits())
    }

    pub fn graph(&self) -> Arc<GraphStore> {
        Arc::clone(&self.graph)
    }

    /// Stop the loop and take the core back.
    pub fn shutdown(mut self) -> Result<PlatformCore, ControlError> {
        let _ = self.commands.send(Command::Shutdown);
        let join = self.join.take().ok_or(ControlError::Stopped)?;
        join.join().map_err(|_| ControlError::Panicked)
    }
}

impl Drop for ControlHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.commands.send(Command::Shutdown);
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::{CatalogSpec, StaticCatalogs};
    use crate::config::PlatformSettings;
    use crate::executor::mock::{simulate_build, RecordingExecutor};
    use crate::graph::ArtifactGraph;
    use crate::registry::InMemoryRegistry;
    use chrono::TimeZone;
    use kiln_api::{BuildPhase, KitPhase};

    fn spawn() -> (ControlHandle, RecordingExecutor, Arc<InMemoryRegistry>) {
        spawn_with(PlatformSettings::default(), Duration::from_secs(3600))
    }

    fn spawn_with(
        settings: PlatformSettings,
        tick_interval: Duration,
    ) -> (ControlHandle, RecordingExecutor, Arc<InMemoryRegistry>) {
        let exec = RecordingExecutor::new();
        let registry = Arc::new(InMemoryRegistry::new());
        let core = PlatformCore::new(
            settings,
            ArtifactGraph::new(),
            Box::new(StaticCatalogs::new([CatalogSpec {
                runtime_version: "1.0".to_string(),
                container_image_tool: Some("builder:1.0".to_string()),
            }])),
            registry.clone(),
            Box::new(exec.clone()),
        );
        (
            ControlLoop::spawn(core, tick_interval),
            exec,
            registry,
        )
    }

    #[test]
    fn test_submit_and_complete_through_loop() {
        let (handle, exec, registry) = spawn();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let request = BuildRequest::new("default", "b1", "1.0").dependency("camel:log");

        let submission = handle.submit(request, now).unwrap();
        let kit = submission.kit().unwrap().clone();
        assert_eq!(handle.kits()[0].phase, KitPhase::Building);

        let id = BuildId::new("default", "b1");
        let spec = exec.last_launch(&id).unwrap();
        let event = simulate_build(&spec, registry.as_ref(), "registry/kiln").unwrap();
        handle.build_event(event, now).unwrap();

        assert_eq!(handle.build(&id).unwrap().unwrap().phase, BuildPhase::Succeeded);
        let graph = handle.graph();
        assert_eq!(graph.read(|g| g.get(&kit).map(|a| a.phase)), Some(KitPhase::Ready));

        let outcome = handle.prune(PruneScope::Lineage, true).unwrap();
        assert_eq!(outcome.artifacts, vec![kit]);

        let core = handle.shutdown().unwrap();
        assert!(core.scheduler().is_idle());
    }

    #[test]
    fn test_platform_errors_are_forwarded() {
        let (handle, _, _) = spawn();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = handle
            .submit(BuildRequest::new("default", "Not_Valid", "1.0"), now)
            .unwrap_err();
        assert!(matches!(err, ControlError::Platform(_)));
        assert!(handle.squash(true).unwrap().is_empty());
    }

    #[test]
    fn test_busy_command_stream_still_ticks() {
        let mut settings = PlatformSettings::default();
        settings.scheduler.build_timeout_seconds = 1;
        let (handle, exec, _) = spawn_with(settings, Duration::from_millis(50));
        let request = BuildRequest::new("default", "slow", "1.0").dependency("camel:log");
        handle.submit(request, Utc::now()).unwrap();

        // Poll faster than the tick interval; the attempt must still expire.
        let id = BuildId::new("default", "slow");
        let started = Instant::now();
        let mut retries = 0;
        while started.elapsed() < Duration::from_secs(5) {
            retries = handle.build(&id).unwrap().unwrap().retries_used;
            if retries > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(retries > 0, "timed out attempt was never retried");
        assert!(exec.launches().len() >= 2);
    }
}
