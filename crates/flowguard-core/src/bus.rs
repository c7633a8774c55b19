//! The event bus: one entry point per lifecycle phase.
//!
//! `dispatch` classifies the invocation, runs the phase's policies in priority
//! order (stopping at the first block), runs the phase's mutators one batch at
//! a time, ranks suggestions after `post`, and hands any new revision to the
//! background persister.

use crate::config::Settings;
use crate::invocation::{Intent, ToolInvocation};
use crate::mutators::{default_mutators, MutationContext, Mutator};
use crate::persist::{FileSink, PersistStatus, Persister, RetryPolicy};
use crate::policy::{Decision, EvalContext, Policy, PolicyFinding, PolicyRegistry};
use crate::session::ShownSuggestions;
use crate::state::{Mutation, WorkflowState};
use crate::store::StateStore;
use crate::suggest::{Suggestion, SuggestionEngine};
use crate::types::{Phase, Verdict};
use chrono::{Local, Timelike};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// DispatchOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub phase: Phase,
    pub verdict: Verdict,
    /// The blocking reason, or every warning joined with `; `.
    pub reason: String,
    pub overridable: bool,
    pub findings: Vec<PolicyFinding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,
    /// Non-fatal problems: failed mutators, pending or abandoned saves.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<String>,
    pub revision: u64,
}

/// What a `pre` hook prints: `{decision, message}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookResponse {
    pub decision: Verdict,
    pub message: String,
}

impl DispatchOutcome {
    pub fn response(&self) -> HookResponse {
        let mut parts: Vec<&str> = Vec::new();
        if !self.reason.is_empty() {
            parts.push(&self.reason);
        }
        parts.extend(self.notices.iter().map(String::as_str));
        HookResponse {
            decision: self.verdict,
            message: parts.join("; "),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

pub struct EventBus {
    root: Arc<Path>,
    settings: Arc<Settings>,
    policies: PolicyRegistry,
    mutators: Vec<Mutator>,
    store: StateStore,
    persister: Option<Persister>,
    /// Last persistence warning surfaced, so each is reported once.
    reported: Option<String>,
}

impl EventBus {
    pub fn new(root: &Path, settings: Settings, state: WorkflowState) -> Self {
        Self {
            root: Arc::from(root),
            settings: Arc::new(settings),
            policies: PolicyRegistry::with_defaults(),
            mutators: default_mutators(),
            store: StateStore::new(state),
            persister: None,
            reported: None,
        }
    }

    /// Load settings and state for `root`. A corrupt state file is moved aside
    /// and replaced by an empty state.
    pub fn open(root: &Path) -> Self {
        let settings = Settings::load(root);
        let state = WorkflowState::load_or_recover(root);
        Self::new(root, settings, state)
    }

    pub fn with_persister(mut self, persister: Persister) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Write new revisions to `.flowguard/state.yaml` in the background.
    /// Needs a Tokio runtime; without one persistence stays off.
    pub fn persist_to_disk(self) -> Self {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("no async runtime; state changes will not be saved");
            return self;
        }
        let sink = Arc::new(FileSink::new(self.root.to_path_buf()));
        let retry = RetryPolicy::from_config(&self.settings.persistence);
        self.with_persister(Persister::spawn(sink, retry))
    }

    pub fn state(&self) -> Arc<WorkflowState> {
        self.store.snapshot()
    }

    pub fn policies_mut(&mut self) -> &mut PolicyRegistry {
        &mut self.policies
    }

    pub fn persist_status(&self) -> Option<PersistStatus> {
        self.persister.as_ref().map(Persister::status)
    }

    /// Ranked next commands without touching state.
    pub fn suggest(&self, after: Option<&str>, hour: u32) -> Vec<Suggestion> {
        SuggestionEngine::new(&self.settings).suggest(&self.store.snapshot(), after, hour)
    }

    pub async fn flush(&mut self) -> Option<PersistStatus> {
        match self.persister.as_mut() {
            Some(p) => Some(p.flush().await),
            None => None,
        }
    }

    pub async fn shutdown(self) -> Option<PersistStatus> {
        match self.persister {
            Some(p) => Some(p.shutdown().await),
            None => None,
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    pub async fn dispatch(&mut self, phase: Phase, invocation: ToolInvocation) -> DispatchOutcome {
        let start_revision = self.store.revision();
        let mut notices = self.persistence_notices();

        let (intent, malformed) = match phase {
            Phase::Pre => match Intent::classify(&invocation, &self.settings) {
                Ok(intent) => (intent, None),
                Err(e) => (Intent::Other, Some(e.to_string())),
            },
            _ => (Intent::classify_lenient(&invocation, &self.settings), None),
        };
        let command = intent.workflow_command(&invocation, &self.settings);

        let (decision, findings) = match malformed {
            Some(reason) => {
                let d = Decision::block(reason);
                let f = vec![PolicyFinding {
                    policy: "invocation".to_string(),
                    verdict: d.verdict,
                    reason: d.reason.clone(),
                }];
                (d, f)
            }
            None => self.evaluate(phase, &invocation, &intent).await,
        };

        tracing::debug!(
            %phase,
            tool = %invocation.command_id,
            %command,
            verdict = %decision.verdict,
            "dispatch"
        );

        self.run_mutators(phase, &invocation, &intent, &command, &decision, &mut notices);

        let suggestions = if phase == Phase::Post {
            self.rank_after(&invocation, &command, &mut notices)
        } else {
            Vec::new()
        };

        if self.store.revision() != start_revision {
            self.submit();
        }

        DispatchOutcome {
            phase,
            verdict: decision.verdict,
            reason: decision.reason,
            overridable: decision.overridable,
            findings,
            suggestions,
            notices,
            revision: self.store.revision(),
        }
    }

    async fn evaluate(
        &self,
        phase: Phase,
        invocation: &ToolInvocation,
        intent: &Intent,
    ) -> (Decision, Vec<PolicyFinding>) {
        let snapshot = self.store.snapshot();
        let budget = Duration::from_millis(self.settings.policy.timeout_ms);
        let mut findings = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        for policy in self.policies.for_phase(phase) {
            let decision = if policy.bounded {
                self.evaluate_bounded(*policy, phase, invocation, intent, &snapshot, budget)
                    .await
            } else {
                let ctx = EvalContext {
                    phase,
                    invocation,
                    intent,
                    state: &snapshot,
                    settings: &self.settings,
                    root: &self.root,
                };
                (policy.evaluate)(&ctx)
            };
            let Some(mut decision) = decision else {
                tracing::debug!(policy = policy.id, "allow");
                continue;
            };
            // Stop-phase policies can only warn.
            if phase == Phase::OnStop && decision.is_block() {
                decision.verdict = Verdict::Warn;
            }
            tracing::debug!(policy = policy.id, verdict = %decision.verdict, "{}", decision.reason);
            if decision.verdict == Verdict::Allow {
                continue;
            }
            findings.push(PolicyFinding {
                policy: policy.id.to_string(),
                verdict: decision.verdict,
                reason: decision.reason.clone(),
            });
            if decision.is_block() {
                return (decision, findings);
            }
            warnings.push(decision.reason);
        }

        let decision = if warnings.is_empty() {
            Decision::allow()
        } else {
            Decision::warn(warnings.join("; "))
        };
        (decision, findings)
    }

    /// Run an advisory policy on the blocking pool under `budget`. Overrunning
    /// or panicking degrades to a warning; the call itself is never blocked
    /// by a broken policy.
    async fn evaluate_bounded(
        &self,
        policy: Policy,
        phase: Phase,
        invocation: &ToolInvocation,
        intent: &Intent,
        snapshot: &Arc<WorkflowState>,
        budget: Duration,
    ) -> Option<Decision> {
        let invocation = invocation.clone();
        let intent = intent.clone();
        let state = Arc::clone(snapshot);
        let settings = Arc::clone(&self.settings);
        let root = Arc::clone(&self.root);

        let task = tokio::task::spawn_blocking(move || {
            let ctx = EvalContext {
                phase,
                invocation: &invocation,
                intent: &intent,
                state: &state,
                settings: &settings,
                root: &root,
            };
            (policy.evaluate)(&ctx)
        });

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::warn!(policy = policy.id, "policy failed: {e}");
                Some(Decision::warn(format!(
                    "policy '{}' failed and was skipped",
                    policy.id
                )))
            }
            Err(_) => {
                tracing::warn!(
                    policy = policy.id,
                    budget_ms = budget.as_millis() as u64,
                    "policy timed out"
                );
                Some(Decision::warn(format!(
                    "policy '{}' exceeded its {} ms budget and was skipped",
                    policy.id,
                    budget.as_millis()
                )))
            }
        }
    }

    /// Each mutator sees the state committed by the ones before it. A failed
    /// batch is discarded whole and reported; the rest still run.
    fn run_mutators(
        &mut self,
        phase: Phase,
        invocation: &ToolInvocation,
        intent: &Intent,
        command: &str,
        decision: &Decision,
        notices: &mut Vec<String>,
    ) {
        for mutator in self.mutators.iter().filter(|m| m.phases.contains(&phase)) {
            let snapshot = self.store.snapshot();
            let ctx = MutationContext {
                phase,
                invocation,
                intent,
                command,
                decision,
                state: &snapshot,
                settings: &self.settings,
                root: &self.root,
            };
            let batch = (mutator.build)(&ctx);
            if batch.is_empty() {
                continue;
            }
            match self.store.commit(batch, &self.settings) {
                Ok(true) => tracing::debug!(
                    mutator = mutator.id,
                    revision = self.store.revision(),
                    "committed"
                ),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(mutator = mutator.id, "mutation skipped: {e}");
                    notices.push(e.to_string());
                }
            }
        }
    }

    /// Rank suggestions after a completed call and remember what was shown.
    fn rank_after(
        &mut self,
        invocation: &ToolInvocation,
        command: &str,
        notices: &mut Vec<String>,
    ) -> Vec<Suggestion> {
        let snapshot = self.store.snapshot();
        let last = invocation
            .effective_outcome()
            .is_success()
            .then_some(command);
        let hour = invocation.timestamp.with_timezone(&Local).hour();
        let suggestions =
            SuggestionEngine::new(&self.settings).suggest(&snapshot, last, hour);

        if let Some(after) = SuggestionEngine::anchor(&snapshot, last) {
            let shown = ShownSuggestions::new(
                after,
                suggestions.iter().map(|s| s.command.clone()).collect(),
                invocation.timestamp,
            );
            if let Err(e) = self
                .store
                .commit(vec![Mutation::ShowSuggestions(shown)], &self.settings)
            {
                tracing::warn!("could not record shown suggestions: {e}");
                notices.push(e.to_string());
            }
        }
        suggestions
    }

    fn submit(&mut self) {
        let snapshot = self.store.snapshot();
        if let Some(p) = self.persister.as_mut() {
            p.submit(snapshot);
        }
    }

    fn persistence_notices(&mut self) -> Vec<String> {
        let Some(warning) = self.persist_status().and_then(|s| s.warning()) else {
            self.reported = None;
            return Vec::new();
        };
        if self.reported.as_deref() == Some(warning.as_str()) {
            return Vec::new();
        }
        self.reported = Some(warning.clone());
        vec![warning]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeatureStatus, Outcome};
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(Path::new("/proj"), Settings::default(), WorkflowState::new())
    }

    async fn run(bus: &mut EventBus, inv: ToolInvocation) -> (DispatchOutcome, DispatchOutcome) {
        let pre = bus.dispatch(Phase::Pre, inv.clone()).await;
        let post = bus.dispatch(Phase::Post, inv).await;
        (pre, post)
    }

    #[tokio::test]
    async fn start_feature_round_trip() {
        let mut bus = bus();
        let (pre, post) = run(
            &mut bus,
            ToolInvocation::new("start_feature").arg("feature", "auth"),
        )
        .await;
        assert_eq!(pre.verdict, Verdict::Allow);
        assert_eq!(post.verdict, Verdict::Allow);
        let state = bus.state();
        assert_eq!(state.active_feature.as_deref(), Some("auth"));
        assert_eq!(state.features["auth"].status, FeatureStatus::Active);
        assert_eq!(post.suggestions[0].command, "generate_tasks");
        assert_eq!(
            state.session.shown.as_ref().map(|s| s.after.as_str()),
            Some("start_feature")
        );
    }

    #[tokio::test]
    async fn blocked_pre_is_recorded() {
        let mut bus = bus();
        let out = bus
            .dispatch(
                Phase::Pre,
                ToolInvocation::new("Bash").arg("command", "rm -rf src"),
            )
            .await;
        assert_eq!(out.verdict, Verdict::Block);
        assert!(!out.overridable);
        assert_eq!(out.findings[0].policy, "destructive_operation");
        let last = bus.state().session.recent.iter().last().cloned().unwrap();
        assert_eq!(last.outcome, Outcome::Blocked);
    }

    #[tokio::test]
    async fn malformed_workflow_command_blocks() {
        let mut bus = bus();
        let out = bus
            .dispatch(Phase::Pre, ToolInvocation::new("start_feature"))
            .await;
        assert_eq!(out.verdict, Verdict::Block);
        assert_eq!(out.findings[0].policy, "invocation");
    }

    fn slow(_: &EvalContext) -> Option<Decision> {
        std::thread::sleep(Duration::from_millis(300));
        Some(Decision::block("too late"))
    }

    #[tokio::test]
    async fn slow_policy_degrades_to_warn() {
        let mut bus = bus();
        bus.policies_mut()
            .register(Policy {
                id: "slow",
                phase: Phase::Pre,
                priority: 50,
                bounded: true,
                description: "sleeps",
                evaluate: slow,
            })
            .unwrap();
        let out = bus.dispatch(Phase::Pre, ToolInvocation::new("Read")).await;
        assert_eq!(out.verdict, Verdict::Warn);
        assert!(out.reason.contains("budget"));
    }

    #[tokio::test]
    async fn failing_mutator_becomes_notice() {
        let mut bus = bus();
        run(
            &mut bus,
            ToolInvocation::new("start_feature").arg("feature", "auth"),
        )
        .await;
        let out = bus
            .dispatch(
                Phase::Post,
                ToolInvocation::new("update_task")
                    .arg("task", "T9")
                    .arg("status", "completed"),
            )
            .await;
        assert!(out.notices.iter().any(|n| n.contains("T9")));
        assert_eq!(bus.state().active_feature.as_deref(), Some("auth"));
    }

    #[tokio::test]
    async fn stop_phase_only_warns() {
        let mut bus = bus();
        run(
            &mut bus,
            ToolInvocation::new("start_feature").arg("feature", "auth"),
        )
        .await;
        run(
            &mut bus,
            ToolInvocation::new("generate_tasks").arg("tasks", json!(["a"])),
        )
        .await;
        run(
            &mut bus,
            ToolInvocation::new("update_task")
                .arg("task", "T1")
                .arg("status", "in_progress"),
        )
        .await;
        let out = bus.dispatch(Phase::OnStop, ToolInvocation::new("stop")).await;
        assert_eq!(out.verdict, Verdict::Warn);
        assert!(bus.state().session.ended_at.is_some());
    }

    #[tokio::test]
    async fn no_change_no_new_revision() {
        let mut bus = bus();
        let inv = ToolInvocation::new("Read").arg("file_path", "a.rs");
        let first = bus.dispatch(Phase::Pre, inv.clone()).await;
        let second = bus.dispatch(Phase::Pre, inv).await;
        assert_eq!(first.revision, second.revision);
    }
}
