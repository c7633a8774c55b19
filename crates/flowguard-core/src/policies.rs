use crate::guard;
use crate::invocation::Intent;
use crate::policy::{Decision, EvalContext, Policy};
use crate::types::{FeatureEvent, FeatureStatus, Phase, TaskStatus};

// ---------------------------------------------------------------------------
// Helper macro for concise policy definitions
// ---------------------------------------------------------------------------

macro_rules! policy {
    (
        id: $id:expr,
        phase: $phase:expr,
        priority: $prio:expr,
        description: $desc:expr,
        evaluate: $eval:expr
        $(, bounded: $bounded:expr)?
    ) => {
        Policy {
            id: $id,
            phase: $phase,
            priority: $prio,
            description: $desc,
            evaluate: $eval,
            bounded: {
                #[allow(unused_assignments, unused_mut)]
                let mut v = true;
                $(v = $bounded;)?
                v
            },
        }
    };
}

// ---------------------------------------------------------------------------
// Evaluators
// ---------------------------------------------------------------------------

fn destructive_operation(ctx: &EvalContext) -> Option<Decision> {
    let guard = &ctx.settings.guard;
    let reason = match ctx.intent {
        Intent::Shell { command } => guard::check_shell(command, guard),
        Intent::FileWrite { paths } => guard::check_write_paths(paths, guard),
        _ => None,
    }?;
    Some(Decision::block(reason))
}

/// Checks that feature and task commands refer to things that exist and are
/// legal from their current status.
fn feature_lifecycle(ctx: &EvalContext) -> Option<Decision> {
    let event = match ctx.intent {
        Intent::StartFeature { feature, .. } => {
            if let Err(e) = crate::paths::validate_feature_id(feature) {
                return Some(Decision::block(e.to_string()));
            }
            return match ctx.state.feature(feature).map(|f| f.status) {
                Some(s @ (FeatureStatus::Completed | FeatureStatus::Archived)) => Some(
                    Decision::block(format!("feature '{feature}' is {s} and cannot be restarted")),
                ),
                _ => None,
            };
        }
        Intent::CompleteFeature { .. } => FeatureEvent::Complete,
        Intent::BlockFeature { .. } => FeatureEvent::Block,
        Intent::UnblockFeature { .. } => FeatureEvent::Unblock,
        Intent::ArchiveFeature { .. } => FeatureEvent::Archive,
        Intent::GenerateTasks { .. } => return task_target(ctx).err(),
        Intent::UpdateTask { task, status, .. } => {
            let ledger = match task_target(ctx) {
                Ok(l) => l,
                Err(d) => return Some(d),
            };
            let current = match ledger.task(task) {
                Some(t) => t.status,
                None => return Some(Decision::block(format!("task {task} not found"))),
            };
            if !current.can_advance_to(*status) {
                return Some(Decision::block(format!(
                    "task {task} cannot move from {current} to {status}; use reopen_task"
                )));
            }
            return None;
        }
        Intent::ReopenTask { task, .. } => {
            let ledger = match task_target(ctx) {
                Ok(l) => l,
                Err(d) => return Some(d),
            };
            return match ledger.task(task) {
                None => Some(Decision::block(format!("task {task} not found"))),
                Some(t) if t.status == TaskStatus::Generated => Some(Decision::block(format!(
                    "task {task} has not been started"
                ))),
                Some(_) => None,
            };
        }
        _ => return None,
    };

    let Some(id) = ctx.target_feature() else {
        return Some(Decision::block(format!(
            "no feature given and none is active; cannot {event}"
        )));
    };
    let Some(feature) = ctx.state.feature(&id) else {
        return Some(Decision::block(format!("feature not found: {id}")));
    };
    match feature.check(event) {
        Ok(_) => None,
        Err(e) => Some(Decision::block(e.to_string())),
    }
}

/// Ledger of the feature a task command targets, or the block explaining why
/// there is none.
fn task_target<'a>(ctx: &'a EvalContext) -> Result<&'a crate::task::TaskLedger, Decision> {
    let id = ctx
        .target_feature()
        .ok_or_else(|| Decision::block("no feature given and none is active"))?;
    let feature = ctx
        .state
        .feature(&id)
        .ok_or_else(|| Decision::block(format!("feature not found: {id}")))?;
    if feature.status.is_terminal() {
        return Err(Decision::block(format!("feature '{id}' is archived")));
    }
    ctx.state
        .ledger_for(&id)
        .ok_or_else(|| Decision::block(format!("no task ledger for '{id}'")))
}

/// Strict mode allows one active feature; otherwise warn past the configured
/// number of parallel branches.
fn single_active_feature(ctx: &EvalContext) -> Option<Decision> {
    let id = match ctx.intent {
        Intent::StartFeature { feature, .. } => feature.clone(),
        Intent::UnblockFeature { .. } => ctx.target_feature()?,
        _ => return None,
    };
    if ctx.state.feature(&id).is_some_and(|f| f.is_active()) {
        return None;
    }
    let others: Vec<&str> = ctx
        .state
        .active_features()
        .map(|f| f.id.as_str())
        .filter(|other| *other != id)
        .collect();

    if ctx.settings.strict_mode {
        if others.is_empty() {
            return None;
        }
        let others = others.join("', '");
        let overridden = ctx.override_granted();
        let reason = if overridden {
            format!("strict mode allows one active feature; '{others}' will be paused")
        } else {
            format!(
                "strict mode allows one active feature and '{others}' is already active; complete or block it first"
            )
        };
        return Some(Decision::block_unless(overridden, reason));
    }

    let limit = ctx.settings.max_active_branches as usize;
    if others.len() + 1 > limit {
        return Some(Decision::warn(format!(
            "{} features would be active, above max_active_branches ({limit})",
            others.len() + 1
        )));
    }
    None
}

fn test_before_complete(ctx: &EvalContext) -> Option<Decision> {
    match ctx.intent {
        Intent::CompleteFeature { .. } => {
            let id = ctx.target_feature()?;
            let blockers = ctx.state.completion_blockers(&id);
            if blockers.is_empty() {
                return None;
            }
            Some(Decision::block_unless(
                ctx.override_granted(),
                format!("cannot complete '{id}': {}", blockers.join("; ")),
            ))
        }
        Intent::UpdateTask {
            task,
            status: TaskStatus::Completed,
            test_ref,
            ..
        } => {
            let id = ctx.target_feature()?;
            let existing = ctx.state.ledger_for(&id)?.task(task)?;
            let test_ref = test_ref.as_deref().or(existing.test_ref.as_deref())?;
            match ctx.state.test_outcome(test_ref) {
                Some(outcome) if !outcome.is_success() => Some(Decision::block(format!(
                    "task {task} cannot complete: test '{test_ref}' last reported {outcome}"
                ))),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Writing a file another open feature already touched.
fn file_conflict(ctx: &EvalContext) -> Option<Decision> {
    let Intent::FileWrite { paths } = ctx.intent else {
        return None;
    };
    let current = ctx.state.active_feature.as_deref();
    for path in paths {
        let normalized = crate::paths::normalize_path(ctx.root, path);
        let owner = ctx.state.features.values().find(|f| {
            Some(f.id.as_str()) != current
                && f.is_active()
                && f.files_touched.contains(&normalized)
        });
        if let Some(f) = owner {
            return Some(Decision::warn(format!(
                "'{normalized}' was also changed under active feature '{}'",
                f.id
            )));
        }
    }
    None
}

/// Session end with work still open on the active feature.
fn unfinished_work(ctx: &EvalContext) -> Option<Decision> {
    let id = ctx.state.active_feature.as_deref()?;
    let blockers = ctx.state.completion_blockers(id);
    if blockers.is_empty() {
        return None;
    }
    Some(Decision::warn(format!(
        "session ending with '{id}' unfinished: {}",
        blockers.join("; ")
    )))
}

// ---------------------------------------------------------------------------
// Default policy set
// ---------------------------------------------------------------------------

/// Built-in policies, lowest priority value first.
pub fn default_policies() -> Vec<Policy> {
    vec![
        // Destructive operations are checked first and never time out.
        policy! {
            id: "destructive_operation",
            phase: Phase::Pre,
            priority: 0,
            description: "block recursive deletes outside scratch paths and credential writes",
            evaluate: destructive_operation,
            bounded: false
        },
        policy! {
            id: "feature_lifecycle",
            phase: Phase::Pre,
            priority: 5,
            description: "feature and task commands must be legal from the current status",
            evaluate: feature_lifecycle
        },
        policy! {
            id: "single_active_feature",
            phase: Phase::Pre,
            priority: 10,
            description: "one active feature in strict mode; warn past max_active_branches otherwise",
            evaluate: single_active_feature
        },
        policy! {
            id: "test_before_complete",
            phase: Phase::Pre,
            priority: 20,
            description: "completion requires finished tasks and passing tests",
            evaluate: test_before_complete
        },
        policy! {
            id: "file_conflict",
            phase: Phase::Pre,
            priority: 30,
            description: "warn when a write touches a file owned by another open feature",
            evaluate: file_conflict
        },
        policy! {
            id: "unfinished_work",
            phase: Phase::OnStop,
            priority: 0,
            description: "warn when the session stops with the active feature unfinished",
            evaluate: unfinished_work
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::invocation::{TaskSpec, ToolInvocation};
    use crate::state::{Mutation, WorkflowState};
    use crate::task::TestRecord;
    use crate::types::{Outcome, Verdict};
    use chrono::Utc;

    fn state_with_active(ids: &[&str]) -> WorkflowState {
        let mut s = WorkflowState::new();
        let settings = Settings::default();
        for id in ids {
            s.apply(
                Mutation::CreateFeature {
                    id: id.to_string(),
                    branch: None,
                    at: Utc::now(),
                },
                &settings,
            )
            .unwrap();
            s.apply(
                Mutation::Transition {
                    feature: id.to_string(),
                    event: FeatureEvent::Start,
                    reason: None,
                    at: Utc::now(),
                },
                &settings,
            )
            .unwrap();
        }
        s
    }

    fn eval(
        f: fn(&EvalContext) -> Option<Decision>,
        state: &WorkflowState,
        settings: &Settings,
        inv: ToolInvocation,
    ) -> Option<Decision> {
        let intent = Intent::classify(&inv, settings).unwrap();
        let ctx = EvalContext {
            phase: Phase::Pre,
            invocation: &inv,
            intent: &intent,
            state,
            settings,
            root: std::path::Path::new("/proj"),
        };
        f(&ctx)
    }

    #[test]
    fn destructive_blocks_rm_rf_src() {
        let d = eval(
            destructive_operation,
            &WorkflowState::new(),
            &Settings::default(),
            ToolInvocation::new("Bash").arg("command", "rm -rf src/"),
        )
        .unwrap();
        assert_eq!(d.verdict, Verdict::Block);
    }

    #[test]
    fn destructive_ignores_override() {
        let d = eval(
            destructive_operation,
            &WorkflowState::new(),
            &Settings::default(),
            ToolInvocation::new("Write")
                .arg("file_path", ".env")
                .arg("override", true),
        )
        .unwrap();
        assert!(d.is_block());
    }

    #[test]
    fn strict_mode_blocks_second_feature() {
        let state = state_with_active(&["auth"]);
        let d = eval(
            single_active_feature,
            &state,
            &Settings::default(),
            ToolInvocation::new("start_feature").arg("feature", "billing"),
        )
        .unwrap();
        assert_eq!(d.verdict, Verdict::Block);
        assert!(d.reason.contains("auth"));
    }

    #[test]
    fn strict_mode_override_warns() {
        let state = state_with_active(&["auth"]);
        let d = eval(
            single_active_feature,
            &state,
            &Settings::default(),
            ToolInvocation::new("start_feature")
                .arg("feature", "billing")
                .arg("override", true),
        )
        .unwrap();
        assert_eq!(d.verdict, Verdict::Warn);
    }

    #[test]
    fn restarting_active_feature_is_fine() {
        let state = state_with_active(&["auth"]);
        assert!(eval(
            single_active_feature,
            &state,
            &Settings::default(),
            ToolInvocation::new("start_feature").arg("feature", "auth"),
        )
        .is_none());
    }

    #[test]
    fn lenient_mode_warns_past_limit() {
        let state = state_with_active(&["a", "b"]);
        let mut settings = Settings::default();
        settings.strict_mode = false;
        settings.max_active_branches = 2;
        let d = eval(
            single_active_feature,
            &state,
            &settings,
            ToolInvocation::new("start_feature").arg("feature", "c"),
        )
        .unwrap();
        assert_eq!(d.verdict, Verdict::Warn);

        settings.max_active_branches = 3;
        assert!(eval(
            single_active_feature,
            &state,
            &settings,
            ToolInvocation::new("start_feature").arg("feature", "c"),
        )
        .is_none());
    }

    #[test]
    fn lifecycle_blocks_illegal_events() {
        let state = state_with_active(&["auth"]);
        let settings = Settings::default();
        let d = eval(
            feature_lifecycle,
            &state,
            &settings,
            ToolInvocation::new("archive_feature"),
        )
        .unwrap();
        assert!(d.is_block());
        assert!(eval(
            feature_lifecycle,
            &state,
            &settings,
            ToolInvocation::new("block_feature"),
        )
        .is_none());
        let d = eval(
            feature_lifecycle,
            &WorkflowState::new(),
            &settings,
            ToolInvocation::new("complete_feature"),
        )
        .unwrap();
        assert!(d.reason.contains("none is active"));
    }

    #[test]
    fn lifecycle_blocks_task_regression() {
        let mut state = state_with_active(&["auth"]);
        let settings = Settings::default();
        state
            .generate_tasks(
                "auth",
                vec![TaskSpec {
                    description: "x".into(),
                    test_ref: None,
                }],
                &settings,
            )
            .unwrap();
        state
            .update_task_status("auth", "T1", TaskStatus::Completed, None)
            .unwrap();
        let d = eval(
            feature_lifecycle,
            &state,
            &settings,
            ToolInvocation::new("update_task")
                .arg("task", "T1")
                .arg("status", "in_progress"),
        )
        .unwrap();
        assert!(d.reason.contains("reopen_task"));
        assert!(eval(
            feature_lifecycle,
            &state,
            &settings,
            ToolInvocation::new("reopen_task").arg("task", "T1"),
        )
        .is_none());
    }

    #[test]
    fn completion_blocked_by_failing_test_unless_overridden() {
        let mut state = state_with_active(&["auth"]);
        let settings = Settings::default();
        state
            .apply(
                Mutation::BindTestRef {
                    feature: "auth".into(),
                    test_ref: "auth:tests".into(),
                },
                &settings,
            )
            .unwrap();
        state.test_records.insert(
            "auth:tests".into(),
            TestRecord::new("auth:tests", Outcome::Failure, Utc::now()),
        );
        let d = eval(
            test_before_complete,
            &state,
            &settings,
            ToolInvocation::new("complete_feature"),
        )
        .unwrap();
        assert_eq!(d.verdict, Verdict::Block);
        assert!(d.reason.contains("failure"));

        let d = eval(
            test_before_complete,
            &state,
            &settings,
            ToolInvocation::new("complete_feature").arg("override", true),
        )
        .unwrap();
        assert_eq!(d.verdict, Verdict::Warn);
    }

    #[test]
    fn file_conflict_warns_on_shared_file() {
        let mut state = state_with_active(&["auth", "billing"]);
        state
            .apply(
                Mutation::TouchFiles {
                    feature: "auth".into(),
                    paths: vec!["src/db.rs".into()],
                },
                &Settings::default(),
            )
            .unwrap();
        // billing is active (started last) and writes auth's file.
        let d = eval(
            file_conflict,
            &state,
            &Settings::default(),
            ToolInvocation::new("Edit").arg("file_path", "./src/db.rs"),
        )
        .unwrap();
        assert_eq!(d.verdict, Verdict::Warn);
        assert!(d.reason.contains("auth"));
    }

    #[test]
    fn unfinished_work_warns_on_stop() {
        let mut state = state_with_active(&["auth"]);
        state
            .generate_tasks(
                "auth",
                vec![TaskSpec {
                    description: "x".into(),
                    test_ref: None,
                }],
                &Settings::default(),
            )
            .unwrap();
        let d = eval(
            unfinished_work,
            &state,
            &Settings::default(),
            ToolInvocation::new("stop"),
        )
        .unwrap();
        assert_eq!(d.verdict, Verdict::Warn);
    }
}
