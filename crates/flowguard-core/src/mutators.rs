use crate::config::Settings;
use crate::invocation::{Intent, ToolInvocation};
use crate::policy::Decision;
use crate::session::InvocationRecord;
use crate::state::{Mutation, WorkflowState};
use crate::types::{FeatureEvent, FeatureStatus, Outcome, Phase};
use chrono::Duration;
use std::path::Path;

// ---------------------------------------------------------------------------
// MutationContext / Mutator
// ---------------------------------------------------------------------------

/// What a mutator sees: the invocation, the verdict it got in this phase, and
/// the state as committed by the mutators that ran before it.
pub struct MutationContext<'a> {
    pub phase: Phase,
    pub invocation: &'a ToolInvocation,
    pub intent: &'a Intent,
    /// Workflow command id (shell test runs fold into `run_tests`).
    pub command: &'a str,
    pub decision: &'a Decision,
    pub state: &'a WorkflowState,
    pub settings: &'a Settings,
    pub root: &'a Path,
}

impl<'a> MutationContext<'a> {
    fn succeeded(&self) -> bool {
        self.invocation.effective_outcome().is_success()
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.invocation.timestamp
    }

    fn feature_for(&self, explicit: Option<&str>) -> Option<String> {
        self.state.resolve_feature(explicit)
    }

    /// In strict mode, pause every active feature other than `id`.
    fn pause_others(&self, id: &str) -> Vec<Mutation> {
        if !self.settings.strict_mode {
            return Vec::new();
        }
        self.state
            .active_features()
            .filter(|f| f.id != id)
            .map(|f| Mutation::Transition {
                feature: f.id.clone(),
                event: FeatureEvent::Block,
                reason: Some(format!("paused: switched to {id}")),
                at: self.now(),
            })
            .collect()
    }
}

pub type MutatorFn = fn(&MutationContext) -> Vec<Mutation>;

/// A named state-update step. Each mutator's batch commits on its own, so a
/// failing mutator never takes the others down with it.
#[derive(Clone, Copy)]
pub struct Mutator {
    pub id: &'static str,
    pub phases: &'static [Phase],
    pub build: MutatorFn,
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id)
            .field("phases", &self.phases)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Mutators
// ---------------------------------------------------------------------------

fn session_clock(ctx: &MutationContext) -> Vec<Mutation> {
    vec![Mutation::TouchSession { at: ctx.now() }]
}

/// When the command was one of the suggestions shown last time, count the
/// transition. Either way the shown list is used up.
fn learn_from_choice(ctx: &MutationContext) -> Vec<Mutation> {
    if ctx.decision.is_block() {
        return Vec::new();
    }
    let Some(shown) = &ctx.state.session.shown else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if ctx.settings.learning_enabled && shown.contains(ctx.command) {
        out.push(Mutation::LearnTransition {
            from: shown.after.clone(),
            to: ctx.command.to_string(),
        });
    }
    out.push(Mutation::ConsumeSuggestions);
    out
}

fn record_blocked(ctx: &MutationContext) -> Vec<Mutation> {
    if !ctx.decision.is_block() {
        return Vec::new();
    }
    let record =
        InvocationRecord::from_invocation(ctx.invocation, ctx.command, ctx.phase, Outcome::Blocked)
            .with_note(ctx.decision.reason.clone());
    vec![Mutation::RecordInvocation(record)]
}

fn record_invocation(ctx: &MutationContext) -> Vec<Mutation> {
    let record = InvocationRecord::from_invocation(
        ctx.invocation,
        ctx.command,
        ctx.phase,
        ctx.invocation.effective_outcome(),
    );
    vec![Mutation::RecordInvocation(record)]
}

fn feature_lifecycle(ctx: &MutationContext) -> Vec<Mutation> {
    if !ctx.succeeded() {
        return Vec::new();
    }
    let now = ctx.now();
    let transition = |feature: String, event: FeatureEvent, reason: Option<String>| {
        Mutation::Transition {
            feature,
            event,
            reason,
            at: now,
        }
    };

    match ctx.intent {
        Intent::StartFeature {
            feature,
            branch,
            linked_issue,
            test_ref,
        } => {
            let mut out = Vec::new();
            match ctx.state.feature(feature).map(|f| f.status) {
                None => {
                    out.extend(ctx.pause_others(feature));
                    out.push(Mutation::CreateFeature {
                        id: feature.clone(),
                        branch: branch.clone(),
                        at: now,
                    });
                    out.push(transition(feature.clone(), FeatureEvent::Start, None));
                }
                Some(FeatureStatus::Planned) => {
                    out.extend(ctx.pause_others(feature));
                    out.push(transition(feature.clone(), FeatureEvent::Start, None));
                }
                Some(FeatureStatus::Blocked) => {
                    out.extend(ctx.pause_others(feature));
                    out.push(transition(feature.clone(), FeatureEvent::Unblock, None));
                }
                Some(FeatureStatus::Active) => {}
                Some(status) => {
                    tracing::debug!(feature = %feature, %status, "start ignored");
                    return Vec::new();
                }
            }
            if let Some(issue) = linked_issue {
                out.push(Mutation::LinkIssue {
                    feature: feature.clone(),
                    issue: issue.clone(),
                });
            }
            if let Some(test_ref) = test_ref {
                out.push(Mutation::BindTestRef {
                    feature: feature.clone(),
                    test_ref: test_ref.clone(),
                });
            }
            out
        }
        Intent::CompleteFeature { feature } => ctx
            .feature_for(feature.as_deref())
            .map(|f| vec![transition(f, FeatureEvent::Complete, None)])
            .unwrap_or_default(),
        Intent::BlockFeature { feature, reason } => ctx
            .feature_for(feature.as_deref())
            .map(|f| vec![transition(f, FeatureEvent::Block, Some(reason.clone()))])
            .unwrap_or_default(),
        Intent::UnblockFeature { feature } => match ctx.feature_for(feature.as_deref()) {
            Some(f) => {
                let mut out = ctx.pause_others(&f);
                out.push(transition(f, FeatureEvent::Unblock, None));
                out
            }
            None => Vec::new(),
        },
        Intent::ArchiveFeature { feature } => ctx
            .feature_for(feature.as_deref())
            .map(|f| vec![transition(f, FeatureEvent::Archive, None)])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn task_ledger(ctx: &MutationContext) -> Vec<Mutation> {
    if !ctx.succeeded() {
        return Vec::new();
    }
    let at = ctx.now();
    let mutation = match ctx.intent {
        Intent::GenerateTasks { feature, items } => {
            ctx.feature_for(feature.as_deref())
                .map(|feature| Mutation::GenerateTasks {
                    feature,
                    items: items.clone(),
                    at,
                })
        }
        Intent::UpdateTask {
            feature,
            task,
            status,
            test_ref,
        } => ctx
            .feature_for(feature.as_deref())
            .map(|feature| Mutation::UpdateTask {
                feature,
                task: task.clone(),
                status: *status,
                test_ref: test_ref.clone(),
                at,
            }),
        Intent::ReopenTask { feature, task } => {
            ctx.feature_for(feature.as_deref())
                .map(|feature| Mutation::ReopenTask {
                    feature,
                    task: task.clone(),
                    at,
                })
        }
        _ => None,
    };
    mutation.into_iter().collect()
}

/// Record test outcomes from `record_test` calls and from shell commands
/// that look like test runs. Without an explicit reference the result is
/// filed under the active feature's test reference, binding
/// `<feature>:tests` when it has none yet.
fn test_results(ctx: &MutationContext) -> Vec<Mutation> {
    let (explicit, outcome, command) = match ctx.intent {
        Intent::RecordTest { test_ref, outcome } => {
            if !ctx.succeeded() {
                return Vec::new();
            }
            (test_ref.clone(), *outcome, None)
        }
        Intent::Shell { command } if ctx.settings.guard.is_test_command(command) => {
            (None, ctx.invocation.effective_outcome(), Some(command.clone()))
        }
        _ => return Vec::new(),
    };

    let mut out = Vec::new();
    let test_ref = match explicit {
        Some(r) => r,
        None => {
            let Some(feature) = ctx.state.active_feature.as_deref().and_then(|id| ctx.state.feature(id))
            else {
                tracing::debug!("test result with no reference and no active feature; ignored");
                return Vec::new();
            };
            match &feature.test_ref {
                Some(r) => r.clone(),
                None => {
                    let r = format!("{}:tests", feature.id);
                    out.push(Mutation::BindTestRef {
                        feature: feature.id.clone(),
                        test_ref: r.clone(),
                    });
                    r
                }
            }
        }
    };
    out.push(Mutation::RecordTest {
        test_ref,
        outcome,
        command,
        at: ctx.now(),
    });
    out
}

fn files_touched(ctx: &MutationContext) -> Vec<Mutation> {
    if !ctx.succeeded() {
        return Vec::new();
    }
    let Intent::FileWrite { paths } = ctx.intent else {
        return Vec::new();
    };
    let Some(feature) = ctx.state.active_feature.clone() else {
        return Vec::new();
    };
    let paths: Vec<String> = paths
        .iter()
        .map(|p| crate::paths::normalize_path(ctx.root, p))
        .collect();
    if paths.is_empty() {
        return Vec::new();
    }
    vec![Mutation::TouchFiles { feature, paths }]
}

/// Archive features that have been `Completed` for longer than the
/// retention window.
fn retention_sweep(ctx: &MutationContext) -> Vec<Mutation> {
    let window = Duration::days(i64::from(ctx.settings.retention.archive_after_days));
    let now = ctx.now();
    ctx.state
        .features
        .values()
        .filter(|f| f.completed_at().is_some_and(|at| now - at > window))
        .map(|f| Mutation::Transition {
            feature: f.id.clone(),
            event: FeatureEvent::Archive,
            reason: Some("retention window elapsed".to_string()),
            at: now,
        })
        .collect()
}

fn session_end(ctx: &MutationContext) -> Vec<Mutation> {
    vec![Mutation::EndSession { at: ctx.now() }]
}

// ---------------------------------------------------------------------------
// Default mutator set
// ---------------------------------------------------------------------------

const ALL: &[Phase] = &[Phase::Pre, Phase::Post, Phase::OnStop];
const PRE: &[Phase] = &[Phase::Pre];
const POST: &[Phase] = &[Phase::Post];
const POST_AND_STOP: &[Phase] = &[Phase::Post, Phase::OnStop];
const STOP: &[Phase] = &[Phase::OnStop];

/// Built-in mutators in execution order.
pub fn default_mutators() -> Vec<Mutator> {
    vec![
        Mutator {
            id: "session_clock",
            phases: ALL,
            build: session_clock,
        },
        Mutator {
            id: "learn_from_choice",
            phases: PRE,
            build: learn_from_choice,
        },
        Mutator {
            id: "record_blocked",
            phases: PRE,
            build: record_blocked,
        },
        Mutator {
            id: "record_invocation",
            phases: POST,
            build: record_invocation,
        },
        Mutator {
            id: "feature_lifecycle",
            phases: POST,
            build: feature_lifecycle,
        },
        Mutator {
            id: "task_ledger",
            phases: POST,
            build: task_ledger,
        },
        Mutator {
            id: "test_results",
            phases: POST,
            build: test_results,
        },
        Mutator {
            id: "files_touched",
            phases: POST,
            build: files_touched,
        },
        Mutator {
            id: "retention_sweep",
            phases: POST_AND_STOP,
            build: retention_sweep,
        },
        Mutator {
            id: "session_end",
            phases: STOP,
            build: session_end,
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
