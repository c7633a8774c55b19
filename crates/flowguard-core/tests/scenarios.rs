use chrono::{Duration, TimeZone, Utc};
use flowguard_core::error::GuardError;
use flowguard_core::persist::{FileSink, Persister, RetryPolicy, StateSink};
use flowguard_core::types::{FeatureStatus, TaskStatus};
use flowguard_core::{
    DispatchOutcome, EventBus, Outcome, Phase, Settings, ToolInvocation, Verdict, WorkflowState,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn bus() -> EventBus {
    EventBus::new(Path::new("/proj"), Settings::default(), WorkflowState::new())
}

/// Pre, then post when the call was not blocked. Returns the pre outcome.
async fn call(bus: &mut EventBus, inv: ToolInvocation) -> DispatchOutcome {
    let pre = bus.dispatch(Phase::Pre, inv.clone()).await;
    if pre.verdict != Verdict::Block {
        bus.dispatch(Phase::Post, inv).await;
    }
    pre
}

fn start(id: &str) -> ToolInvocation {
    ToolInvocation::new("start_feature").arg("feature", id)
}

fn complete_task(task: &str) -> ToolInvocation {
    ToolInvocation::new("update_task")
        .arg("task", task)
        .arg("status", "completed")
}

async fn with_four_tasks(bus: &mut EventBus) {
    call(bus, start("f1")).await;
    let out = call(
        bus,
        ToolInvocation::new("generate_tasks").arg("tasks", json!(["api", "db", "ui", "docs"])),
    )
    .await;
    assert_eq!(out.verdict, Verdict::Allow);
    assert_eq!(bus.state().ledger_for("f1").unwrap().tasks.len(), 4);
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_feature_blocked_in_strict_mode() {
    let mut bus = bus();
    assert_eq!(call(&mut bus, start("f1")).await.verdict, Verdict::Allow);

    let out = call(&mut bus, start("f2")).await;
    assert_eq!(out.verdict, Verdict::Block);
    assert!(out.reason.contains("f1"), "reason: {}", out.reason);
    assert!(out.overridable);

    let state = bus.state();
    assert_eq!(state.active_feature.as_deref(), Some("f1"));
    assert!(state.feature("f2").is_none());
}

#[tokio::test]
async fn override_pauses_previous_feature() {
    let mut bus = bus();
    call(&mut bus, start("f1")).await;
    let out = call(&mut bus, start("f2").arg("override", true)).await;
    assert_eq!(out.verdict, Verdict::Warn);

    let state = bus.state();
    assert_eq!(state.active_count(), 1);
    assert_eq!(state.active_feature.as_deref(), Some("f2"));
    assert_eq!(state.features["f1"].status, FeatureStatus::Blocked);
}

#[tokio::test]
async fn incomplete_tasks_block_completion() {
    let mut bus = bus();
    with_four_tasks(&mut bus).await;
    for t in ["T1", "T2", "T3"] {
        assert_eq!(call(&mut bus, complete_task(t)).await.verdict, Verdict::Allow);
    }
    assert!((bus.state().completion_ratio("f1") - 0.75).abs() < 1e-9);

    let out = call(&mut bus, ToolInvocation::new("complete_feature")).await;
    assert_eq!(out.verdict, Verdict::Block);
    assert!(out.reason.contains("3/4"), "reason: {}", out.reason);
    assert_eq!(bus.state().features["f1"].status, FeatureStatus::Active);
}

#[tokio::test]
async fn finished_tasks_with_passing_test_complete() {
    let mut bus = bus();
    with_four_tasks(&mut bus).await;
    for t in ["T1", "T2", "T3"] {
        call(&mut bus, complete_task(t)).await;
    }
    call(
        &mut bus,
        ToolInvocation::new("record_test")
            .arg("test_ref", "unit")
            .arg("outcome", "passed"),
    )
    .await;
    let out = call(&mut bus, complete_task("T4").arg("test_ref", "unit")).await;
    assert_eq!(out.verdict, Verdict::Allow);

    let out = call(&mut bus, ToolInvocation::new("complete_feature")).await;
    assert_eq!(out.verdict, Verdict::Allow);
    let state = bus.state();
    assert_eq!(state.features["f1"].status, FeatureStatus::Completed);
    assert!(state.active_feature.is_none());
}

#[tokio::test]
async fn failing_test_blocks_task_completion() {
    let mut bus = bus();
    with_four_tasks(&mut bus).await;
    call(
        &mut bus,
        ToolInvocation::new("record_test")
            .arg("test_ref", "unit")
            .arg("outcome", "failed"),
    )
    .await;
    let out = call(&mut bus, complete_task("T1").arg("test_ref", "unit")).await;
    assert_eq!(out.verdict, Verdict::Block);
    assert!(!out.overridable);
    let ledger = bus.state().ledger_for("f1").cloned().unwrap();
    assert_eq!(ledger.task("T1").unwrap().status, TaskStatus::Generated);
}

#[tokio::test]
async fn chosen_suggestions_are_learned_across_sessions() {
    let mut bus = bus();
    let baseline = bus.suggest(Some("checkpoint"), 12);
    let baseline_rank = baseline.iter().position(|s| s.command == "resume").unwrap();

    let day = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    for i in 0..3 {
        let at = day + Duration::days(i);
        let mut a = ToolInvocation::new("checkpoint");
        a.timestamp = at;
        let mut b = ToolInvocation::new("resume");
        b.timestamp = at + Duration::minutes(5);
        let mut stop = ToolInvocation::new("stop");
        stop.timestamp = at + Duration::minutes(10);

        call(&mut bus, a).await;
        call(&mut bus, b).await;
        bus.dispatch(Phase::OnStop, stop).await;
        assert_eq!(
            bus.state().learned.count("checkpoint", "resume"),
            (i + 1) as u64
        );
    }

    let after = bus.suggest(Some("checkpoint"), 12);
    let rank = after.iter().position(|s| s.command == "resume").unwrap();
    assert!(rank <= baseline_rank);
    assert!(after[rank].score > baseline[baseline_rank].score);
}

/// Fails a fixed number of writes before delegating to a [`FileSink`].
struct FailingThenFile {
    failures: AtomicU32,
    inner: FileSink,
}

impl StateSink for FailingThenFile {
    fn write(&self, state: &WorkflowState) -> flowguard_core::Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GuardError::Persistence("disk unavailable".into()));
        }
        self.inner.write(state)
    }
}

#[tokio::test]
async fn transient_write_failures_recover() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(".flowguard")).unwrap();
    let sink = Arc::new(FailingThenFile {
        failures: AtomicU32::new(2),
        inner: FileSink::new(dir.path()),
    });
    let retry = RetryPolicy {
        base: std::time::Duration::from_millis(5),
        cap: std::time::Duration::from_millis(20),
        max_attempts: 5,
    };
    let mut bus = EventBus::new(dir.path(), Settings::default(), WorkflowState::new())
        .with_persister(Persister::spawn(sink, retry));

    for inv in [
        start("f1"),
        ToolInvocation::new("generate_tasks").arg("tasks", json!(["a", "b"])),
        complete_task("T1"),
    ] {
        let out = call(&mut bus, inv).await;
        assert_ne!(out.verdict, Verdict::Block);
    }

    let status = bus.flush().await.unwrap();
    assert_eq!(status.last_written, Some(bus.state().revision));
    assert!(status.abandoned.is_none());

    let on_disk = WorkflowState::load(dir.path()).unwrap();
    let memory = bus.state();
    assert_eq!(on_disk.revision, memory.revision);
    assert_eq!(on_disk.active_feature, memory.active_feature);
    assert_eq!(on_disk.features, memory.features);
    assert_eq!(on_disk.ledgers, memory.ledgers);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn strict_mode_never_has_two_active_features() {
    let mut bus = bus();
    let steps = [
        start("a"),
        start("b"),
        start("b").arg("override", true),
        ToolInvocation::new("unblock_feature").arg("feature", "a"),
        ToolInvocation::new("unblock_feature")
            .arg("feature", "a")
            .arg("force", true),
        start("c").arg("override", true),
        ToolInvocation::new("block_feature").arg("reason", "waiting on review"),
        start("b"),
    ];
    for inv in steps {
        call(&mut bus, inv).await;
        assert!(bus.state().active_count() <= 1);
    }
    assert_eq!(bus.state().active_feature.as_deref(), Some("b"));
}

#[tokio::test]
async fn pre_evaluation_is_idempotent() {
    let mut seed = bus();
    call(&mut seed, start("f1")).await;
    let state = (*seed.state()).clone();

    let inv = start("f2");
    let mut first = EventBus::new(Path::new("/proj"), Settings::default(), state.clone());
    let mut second = EventBus::new(Path::new("/proj"), Settings::default(), state);
    let a = first.dispatch(Phase::Pre, inv.clone()).await;
    let b = second.dispatch(Phase::Pre, inv.clone()).await;
    assert_eq!(a, b);

    let again = first.dispatch(Phase::Pre, inv).await;
    assert_eq!(again.verdict, a.verdict);
    assert_eq!(again.findings, a.findings);
}

#[tokio::test]
async fn task_progress_never_regresses() {
    let mut bus = bus();
    with_four_tasks(&mut bus).await;
    let mut last_ratio = bus.state().completion_ratio("f1");

    let steps = [
        complete_task("T1"),
        ToolInvocation::new("update_task")
            .arg("task", "T1")
            .arg("status", "in_progress"),
        ToolInvocation::new("update_task")
            .arg("task", "T2")
            .arg("status", "in_progress"),
        complete_task("T2"),
        ToolInvocation::new("update_task")
            .arg("task", "T2")
            .arg("status", "generated"),
    ];
    for inv in steps {
        call(&mut bus, inv).await;
        let ratio = bus.state().completion_ratio("f1");
        assert!(ratio >= last_ratio, "{ratio} < {last_ratio}");
        last_ratio = ratio;
    }
    assert!((last_ratio - 0.5).abs() < 1e-9);

    let out = call(
        &mut bus,
        ToolInvocation::new("reopen_task").arg("task", "T1"),
    )
    .await;
    assert_eq!(out.verdict, Verdict::Allow);
    let ledger = bus.state().ledger_for("f1").cloned().unwrap();
    assert_eq!(ledger.task("T1").unwrap().status, TaskStatus::InProgress);
}

#[tokio::test]
async fn post_failure_outcome_leaves_features_alone() {
    let mut bus = bus();
    let inv = start("f1").with_outcome(Outcome::Failure);
    bus.dispatch(Phase::Pre, inv.clone()).await;
    bus.dispatch(Phase::Post, inv).await;
    assert!(bus.state().features.is_empty());
    assert_eq!(
        bus.state().session.recent.iter().last().map(|r| r.outcome),
        Some(Outcome::Failure)
    );
}
