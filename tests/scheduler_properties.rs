//! Scheduler ordering and retry budget
//!
//! Drives the public scheduler API against the recording executor.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeSet;

use kiln::executor::mock::RecordingExecutor;
use kiln::executor::BuildEvent;
use kiln::id::BuildId;
use kiln::scheduler::{BuildTask, Scheduler, SchedulerUpdate, RETRIES_EXHAUSTED};
use kiln::ArtifactId;
use kiln_api::{BuildPhase, BuildRequest, FailureKind, OrderStrategy, PlatformConfig};

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

fn id(name: &str) -> BuildId {
    BuildId::new("default", name)
}

fn kit(name: &str) -> ArtifactId {
    ArtifactId::new("default", format!("kit-{}", name))
}

fn task(name: &str) -> BuildTask {
    let request = BuildRequest::new("default", name, "1.0").dependency(format!("dep:{}", name));
    BuildTask::root(kit(name), &request, format!("fp-{}", name), Some("base:latest".to_string()))
}

/// `name` layered on the kit built by `parent`.
fn child_task(name: &str, parent: &str) -> BuildTask {
    let request = BuildRequest::new("default", name, "1.0")
        .dependency(format!("dep:{}", parent))
        .dependency(format!("dep:{}", name));
    BuildTask::root(kit(name), &request, format!("fp-{}", name), None).on_base(
        kit(parent),
        None,
        BTreeSet::from([format!("dep:{}", name)]),
        Some(id(parent)),
    )
}

fn config(strategy: OrderStrategy, max: Option<u32>) -> PlatformConfig {
    PlatformConfig {
        order_strategy: strategy,
        max_running_builds: max,
        build_timeout_seconds: 300,
        max_retries: 5,
    }
}

fn succeed(
    s: &mut Scheduler,
    exec: &mut RecordingExecutor,
    name: &str,
    now: DateTime<Utc>,
) -> Vec<SchedulerUpdate> {
    let spec = exec.last_launch(&id(name)).unwrap();
    let mut updates = s.on_event(
        BuildEvent::succeeded(&spec, format!("registry/kiln@sha256:{}", name), None),
        exec,
        now,
    );
    updates.extend(s.schedule(exec, now));
    updates
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_fifo_runs_in_arrival_order() {
    let mut s = Scheduler::new(config(OrderStrategy::Fifo, Some(1)));
    let mut exec = RecordingExecutor::new();
    for name in ["a", "b", "c"] {
        s.enqueue(id(name), task(name), t(0)).unwrap();
    }

    s.schedule(&mut exec, t(0));
    assert_eq!(s.build(&id("a")).unwrap().phase, BuildPhase::Running);
    assert_eq!(s.build(&id("b")).unwrap().phase, BuildPhase::Pending);

    succeed(&mut s, &mut exec, "a", t(10));
    assert_eq!(s.build(&id("b")).unwrap().phase, BuildPhase::Running);
    assert_eq!(s.build(&id("c")).unwrap().phase, BuildPhase::Pending);

    succeed(&mut s, &mut exec, "b", t(20));
    succeed(&mut s, &mut exec, "c", t(30));

    assert_eq!(exec.start_order(), vec!["a", "b", "c"]);
    let started: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|n| s.build(&id(n)).unwrap().started_at.unwrap())
        .collect();
    assert!(started[0] < started[1] && started[1] < started[2]);
    assert!(s.is_idle());
}

#[test]
fn test_parent_admitted_before_earlier_child() {
    let mut s = Scheduler::new(config(OrderStrategy::Dependencies, Some(1)));
    let mut exec = RecordingExecutor::new();

    s.enqueue(id("blocker"), task("blocker"), t(0)).unwrap();
    s.schedule(&mut exec, t(0));

    // The child arrives before its parent.
    s.enqueue(id("b"), child_task("b", "a"), t(1)).unwrap();
    s.enqueue(id("a"), task("a"), t(2)).unwrap();

    succeed(&mut s, &mut exec, "blocker", t(3));
    assert_eq!(s.running_ids(), vec![id("a")]);
    assert_eq!(s.build(&id("b")).unwrap().phase, BuildPhase::Pending);

    succeed(&mut s, &mut exec, "a", t(4));
    assert_eq!(exec.start_order(), vec!["blocker", "a", "b"]);
    assert_eq!(
        exec.last_launch(&id("b")).unwrap().base_image.as_deref(),
        Some("registry/kiln@sha256:a")
    );
}

#[test]
fn test_child_withheld_with_free_slots() {
    let mut s = Scheduler::new(config(OrderStrategy::Dependencies, None));
    let mut exec = RecordingExecutor::new();
    s.enqueue(id("a"), task("a"), t(0)).unwrap();
    s.enqueue(id("b"), child_task("b", "a"), t(0)).unwrap();
    s.enqueue(id("c"), task("c"), t(0)).unwrap();

    s.schedule(&mut exec, t(0));
    assert_eq!(exec.start_order(), vec!["a", "c"]);
    assert_eq!(s.pending_len(), 1);

    succeed(&mut s, &mut exec, "a", t(5));
    assert_eq!(exec.start_order(), vec!["a", "c", "b"]);
}

#[test]
fn test_child_of_failed_parent_never_starts() {
    let mut s = Scheduler::new(config(OrderStrategy::Dependencies, None));
    let mut exec = RecordingExecutor::new();
    s.enqueue(id("a"), task("a"), t(0)).unwrap();
    s.enqueue(id("b"), child_task("b", "a"), t(0)).unwrap();
    s.schedule(&mut exec, t(0));

    let spec = exec.last_launch(&id("a")).unwrap();
    s.on_event(BuildEvent::failed(&spec, "compilation failed", false), &mut exec, t(1));
    s.schedule(&mut exec, t(1));

    let b = s.build(&id("b")).unwrap();
    assert_eq!(b.phase, BuildPhase::Error);
    assert_eq!(b.failure.as_ref().unwrap().kind, FailureKind::BaseFailed);
    assert_eq!(exec.start_order(), vec!["a"]);
}

// =============================================================================
// Retry budget
// =============================================================================

#[test]
fn test_five_timeouts_fail_the_build() {
    let mut s = Scheduler::new(config(OrderStrategy::Fifo, None));
    let mut exec = RecordingExecutor::new();
    s.enqueue(id("a"), task("a"), t(0)).unwrap();
    s.schedule(&mut exec, t(0));

    for i in 1..=5 {
        s.tick(&mut exec, t(301 * i));
    }

    let a = s.build(&id("a")).unwrap();
    assert_eq!(a.phase, BuildPhase::Error);
    assert_eq!(a.failure.as_ref().unwrap().reason, RETRIES_EXHAUSTED);
    assert_eq!(exec.launches().len(), 5);
}

#[test]
fn test_four_timeouts_then_success() {
    let mut s = Scheduler::new(config(OrderStrategy::Fifo, None));
    let mut exec = RecordingExecutor::new();
    s.enqueue(id("a"), task("a"), t(0)).unwrap();
    s.schedule(&mut exec, t(0));

    for i in 1..=4 {
        s.tick(&mut exec, t(301 * i));
    }
    succeed(&mut s, &mut exec, "a", t(1300));

    let a = s.build(&id("a")).unwrap();
    assert_eq!(a.phase, BuildPhase::Succeeded);
    assert_eq!(a.retries_used, 4);
    assert_eq!(a.image.as_deref(), Some("registry/kiln@sha256:a"));
}

#[test]
fn test_retry_budget_is_configurable() {
    let mut cfg = config(OrderStrategy::Fifo, None);
    cfg.max_retries = 2;
    let mut s = Scheduler::new(cfg);
    let mut exec = RecordingExecutor::new();
    s.enqueue(id("a"), task("a"), t(0)).unwrap();
    s.schedule(&mut exec, t(0));

    let spec = exec.last_launch(&id("a")).unwrap();
    s.on_event(BuildEvent::failed(&spec, "pod evicted", true), &mut exec, t(1));
    assert_eq!(s.build(&id("a")).unwrap().phase, BuildPhase::Running);

    let spec = exec.last_launch(&id("a")).unwrap();
    s.on_event(BuildEvent::failed(&spec, "pod evicted", true), &mut exec, t(2));
    assert_eq!(s.build(&id("a")).unwrap().phase, BuildPhase::Error);
}
