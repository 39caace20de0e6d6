//! Recording executor with failure injection.
//!
//! Launches are recorded instead of run; tests inspect them and feed back
//! [`BuildEvent`]s, optionally producing a real image in a registry with
//! [`simulate_build`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use ulid::Ulid;

use super::{BuildEvent, BuildExecutor, LaunchError, LaunchSpec};
use crate::id::BuildId;
use crate::registry::{ImageManifest, Layer, Registry, RegistryError};

/// Failure to return from `launch` for one build.
#[derive(Debug, Clone)]
pub struct LaunchFailure {
    pub error: LaunchError,
    /// Number of launches to fail before succeeding (None = always fail).
    pub fail_count: Option<u32>,
}

impl LaunchFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            error: LaunchError::Transient(message.into()),
            fail_count: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            error: LaunchError::Fatal(message.into()),
            fail_count: None,
        }
    }

    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }
}

#[derive(Debug, Default)]
struct ExecutorLog {
    launches: Vec<LaunchSpec>,
    cancels: Vec<(BuildId, Ulid)>,
    failures: HashMap<String, LaunchFailure>,
    calls: HashMap<String, u32>,
}

impl ExecutorLog {
    fn check(&mut self, build: &BuildId) -> Option<LaunchError> {
        let key = build.to_string();
        let config = self.failures.get(&key)?;
        let count = self.calls.entry(key).or_insert(0);
        *count += 1;
        if let Some(limit) = config.fail_count {
            if *count > limit {
                return None;
            }
        }
        Some(config.error.clone())
    }
}

/// Executor that records every call. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingExecutor {
    log: Arc<Mutex<ExecutorLog>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExecutorLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail launches of `build` as configured.
    pub fn inject(&self, build: &BuildId, failure: LaunchFailure) {
        let mut log = self.lock();
        log.failures.insert(build.to_string(), failure);
        log.calls.insert(build.to_string(), 0);
    }

    pub fn clear(&self) {
        let mut log = self.lock();
        log.failures.clear();
        log.calls.clear();
    }

    /// Accepted launches, in order.
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.lock().launches.clone()
    }

    /// Most recent accepted launch of `build`.
    pub fn last_launch(&self, build: &BuildId) -> Option<LaunchSpec> {
        self.lock()
            .launches
            .iter()
            .rev()
            .find(|l| &l.build == build)
            .cloned()
    }

    /// Build names in the order of their first accepted launch.
    pub fn start_order(&self) -> Vec<String> {
        let log = self.lock();
        let mut order: Vec<String> = Vec::new();
        for launch in &log.launches {
            if !order.contains(&launch.build.name) {
                order.push(launch.build.name.clone());
            }
        }
        order
    }

    pub fn cancels(&self) -> Vec<(BuildId, Ulid)> {
        self.lock().cancels.clone()
    }
}

impl BuildExecutor for RecordingExecutor {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<(), LaunchError> {
        let mut log = self.lock();
        if let Some(err) = log.check(&spec.build) {
            return Err(err);
        }
        log.launches.push(spec.clone());
        Ok(())
    }

    fn cancel(&mut self, build: &BuildId, execution_id: Ulid) {
        self.lock().cancels.push((build.clone(), execution_id));
    }
}

/// Produce the image an attempt would have built and return its success event.
///
/// The image holds the base image's layers (none when the base is absent
/// from the registry) plus one layer with a file per delta dependency.
pub fn simulate_build(
    spec: &LaunchSpec,
    registry: &dyn Registry,
    repository: &str,
) -> Result<BuildEvent, RegistryError> {
    let mut manifest = match &spec.base_image {
        Some(base) => match registry.read_image(base) {
            Ok(m) => m,
            Err(RegistryError::ImageNotFound(_)) => ImageManifest::default(),
            Err(e) => return Err(e),
        },
        None => ImageManifest::default(),
    };

    let mut layer = Layer::new();
    for dep in &spec.delta {
        layer = layer.with_file(format!("deps/{}", dep.replace(':', "/")), dep.clone());
    }
    manifest.layers.push(registry.write_layer(&layer)?);
    manifest.history.push(format!("build {}", spec.kit));
    manifest
        .labels
        .insert("kiln.kit".to_string(), spec.kit.to_string());

    let digest = manifest.digest()?;
    let image = registry.write_image(repository, &manifest)?;
    Ok(BuildEvent::succeeded(spec, image, Some(digest)))
}
