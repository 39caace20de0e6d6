//! Build state machine
//!
//! Build phases: Pending → Running → {Succeeded | Error}, with
//! Running → Running for each retry and Pending → Error for builds that
//! fail before admission (incompatible catalog, failed base build).

use chrono::{DateTime, Utc};

use kiln_api::{Build, BuildFailure, BuildPhase, FailureKind};

use super::SchedulerError;

/// Whether `from → to` is a legal phase change.
pub fn can_transition(from: BuildPhase, to: BuildPhase) -> bool {
    matches!(
        (from, to),
        (BuildPhase::Pending, BuildPhase::Running)
            | (BuildPhase::Pending, BuildPhase::Error)
            | (BuildPhase::Running, BuildPhase::Running)
            | (BuildPhase::Running, BuildPhase::Succeeded)
            | (BuildPhase::Running, BuildPhase::Error)
    )
}

/// Move a build to a new phase.
pub(crate) fn transition(build: &mut Build, to: BuildPhase) -> Result<(), SchedulerError> {
    if !can_transition(build.phase, to) {
        return Err(SchedulerError::InvalidTransition {
            build: format!("{}/{}", build.namespace, build.name),
            from: build.phase,
            to,
        });
    }
    build.phase = to;
    Ok(())
}

/// Move a build to Error with a structured failure.
pub(crate) fn fail(
    build: &mut Build,
    kind: FailureKind,
    reason: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<BuildFailure, SchedulerError> {
    transition(build, BuildPhase::Error)?;
    let failure = BuildFailure {
        kind,
        reason: reason.into(),
        recorded_at: now,
    };
    build.failure = Some(failure.clone());
    build.completed_at = Some(now);
    Ok(failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_valid_transitions() {
        assert!(can_transition(BuildPhase::Pending, BuildPhase::Running));
        assert!(can_transition(BuildPhase::Pending, BuildPhase::Error));
        assert!(can_transition(BuildPhase::Running, BuildPhase::Running));
        assert!(can_transition(BuildPhase::Running, BuildPhase::Succeeded));
        assert!(can_transition(BuildPhase::Running, BuildPhase::Error));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!can_transition(BuildPhase::Pending, BuildPhase::Succeeded));
        assert!(!can_transition(BuildPhase::Pending, BuildPhase::Pending));
        assert!(!can_transition(BuildPhase::Succeeded, BuildPhase::Running));
        assert!(!can_transition(BuildPhase::Error, BuildPhase::Running));
        assert!(!can_transition(BuildPhase::Error, BuildPhase::Error));
        assert!(!can_transition(BuildPhase::Running, BuildPhase::Pending));
    }

    #[test]
    fn test_fail_records_failure() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut build = Build::pending("default", "b", "kit-b");
        let failure = fail(&mut build, FailureKind::Incompatible, "no builder", now).unwrap();
        assert_eq!(build.phase, BuildPhase::Error);
        assert_eq!(build.failure, Some(failure));
        assert_eq!(build.completed_at, Some(now));

        assert!(matches!(
            fail(&mut build, FailureKind::Fatal, "again", now),
            Err(SchedulerError::InvalidTransition { .. })
        ));
    }
}
