//! Build requests and build status records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::names::{validate_name, NameError};

/// Base image and incremental-build constraints attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStrategy {
    /// Pinned base image; disables incremental matching when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// Whether the request may layer on top of an existing kit.
    #[serde(default = "default_incremental")]
    pub incremental: bool,
}

fn default_incremental() -> bool {
    true
}

impl Default for BuildStrategy {
    fn default() -> Self {
        Self {
            base_image: None,
            incremental: true,
        }
    }
}

/// A request to produce a kit for a dependency set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub namespace: String,
    pub name: String,
    /// Resolved dependency coordinates (e.g. `camel:http`, `mvn:org.acme:lib:1.0`).
    pub dependencies: BTreeSet<String>,
    /// Build-time properties; all values are strings.
    #[serde(default)]
    pub build_properties: BTreeMap<String, String>,
    /// Target runtime catalog version.
    pub runtime_version: String,
    #[serde(default)]
    pub strategy: BuildStrategy,
    /// Priority label given to the kit this request produces.
    #[serde(default)]
    pub priority: i32,
}

impl BuildRequest {
    /// Create a request with default strategy and no properties.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        runtime_version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            dependencies: BTreeSet::new(),
            build_properties: BTreeMap::new(),
            runtime_version: runtime_version.into(),
            strategy: BuildStrategy::default(),
            priority: 0,
        }
    }

    /// Add a dependency.
    pub fn dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Add several dependencies.
    pub fn dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Set a build property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_properties.insert(key.into(), value.into());
        self
    }

    /// Pin the base image.
    pub fn base_image(mut self, image: impl Into<String>) -> Self {
        self.strategy.base_image = Some(image.into());
        self
    }

    /// Enable or disable incremental matching.
    pub fn incremental(mut self, incremental: bool) -> Self {
        self.strategy.incremental = incremental;
        self
    }

    /// Set the priority label.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Validate names and the runtime version.
    pub fn validate(&self) -> Result<(), NameError> {
        validate_name("namespace", &self.namespace)?;
        validate_name("name", &self.name)?;
        if self.runtime_version.trim().is_empty() {
            return Err(NameError::Empty {
                field: "runtime_version",
            });
        }
        Ok(())
    }
}

/// Build lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum BuildPhase {
    Pending,
    Running,
    Succeeded,
    Error,
}

impl BuildPhase {
    /// Whether the build can no longer change phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildPhase::Succeeded | BuildPhase::Error)
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildPhase::Pending => write!(f, "Pending"),
            BuildPhase::Running => write!(f, "Running"),
            BuildPhase::Succeeded => write!(f, "Succeeded"),
            BuildPhase::Error => write!(f, "Error"),
        }
    }
}

/// Classification of a build failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Executor timeout or scheduling delay; retried.
    Transient,
    /// Compile or packaging error reported by the builder.
    Fatal,
    /// The runtime catalog cannot produce a builder image.
    Incompatible,
    /// Transient failures consumed the whole retry budget.
    RetriesExhausted,
    /// The incremental base build failed.
    BaseFailed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Fatal => write!(f, "fatal"),
            FailureKind::Incompatible => write!(f, "incompatible"),
            FailureKind::RetriesExhausted => write!(f, "retries_exhausted"),
            FailureKind::BaseFailed => write!(f, "base_failed"),
        }
    }
}

/// Structured failure surfaced on a build in Error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub kind: FailureKind,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Condition types carried on a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    Scheduled,
}

/// A status condition on a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// Build status surfaced back to the reconciliation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub namespace: String,
    pub name: String,
    /// Name of the kit this build produces.
    pub kit: String,
    /// Kit this build layers on, when built incrementally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_kit: Option<String>,
    /// Base image the build starts from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    pub phase: BuildPhase,
    pub retries_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Start of the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<BuildFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<BuildCondition>,
}

impl Build {
    /// Create a Pending build record.
    pub fn pending(namespace: impl Into<String>, name: impl Into<String>, kit: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kit: kit.into(),
            base_kit: None,
            base_image: None,
            phase: BuildPhase::Pending,
            retries_used: 0,
            image: None,
            started_at: None,
            completed_at: None,
            failure: None,
            conditions: Vec::new(),
        }
    }

    /// Find a condition by kind.
    pub fn condition(&self, kind: ConditionKind) -> Option<&BuildCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Insert or replace a condition. The transition time only moves when
    /// the status flips.
    pub fn set_condition(
        &mut self,
        kind: ConditionKind,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.into();
        let message = message.into();
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.kind == kind) {
            if existing.status != status {
                existing.last_transition = now;
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
        } else {
            self.conditions.push(BuildCondition {
                kind,
                status,
                reason,
                message,
                last_transition: now,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_request_builder() {
        let req = BuildRequest::new("default", "kit-a", "1.15.0")
            .dependencies(["camel:http", "camel:log"])
            .dependency("camel:http")
            .property("quarkus.native", "false")
            .priority(3);

        assert_eq!(req.dependencies.len(), 2);
        assert_eq!(req.build_properties["quarkus.native"], "false");
        assert_eq!(req.priority, 3);
        assert!(req.strategy.incremental);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_request_validation() {
        let req = BuildRequest::new("Default", "kit-a", "1.15.0");
        assert!(req.validate().is_err());

        let req = BuildRequest::new("default", "kit-a", "  ");
        assert_eq!(
            req.validate(),
            Err(NameError::Empty {
                field: "runtime_version"
            })
        );
    }

    #[test]
    fn test_strategy_defaults_on_deserialize() {
        let req: BuildRequest = serde_json::from_str(
            r#"{"namespace":"default","name":"a","dependencies":["x"],"runtime_version":"1.0"}"#,
        )
        .unwrap();
        assert!(req.strategy.incremental);
        assert_eq!(req.strategy.base_image, None);
        assert_eq!(req.priority, 0);
    }

    #[test]
    fn test_phase_terminal() {
        assert!(!BuildPhase::Pending.is_terminal());
        assert!(!BuildPhase::Running.is_terminal());
        assert!(BuildPhase::Succeeded.is_terminal());
        assert!(BuildPhase::Error.is_terminal());
        assert_eq!(serde_json::to_string(&BuildPhase::Succeeded).unwrap(), "\"Succeeded\"");
    }

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap();

        let mut build = Build::pending("default", "b", "kit-b");
        build.set_condition(ConditionKind::Scheduled, false, "Waiting", "queued", t0);
        build.set_condition(ConditionKind::Scheduled, false, "Waiting", "still queued", t1);
        assert_eq!(build.conditions.len(), 1);
        assert_eq!(build.conditions[0].last_transition, t0);
        assert_eq!(build.conditions[0].message, "still queued");

        build.set_condition(ConditionKind::Scheduled, true, "Ready", "admitted", t2);
        let cond = build.condition(ConditionKind::Scheduled).unwrap();
        assert!(cond.status);
        assert_eq!(cond.last_transition, t2);
    }
}
