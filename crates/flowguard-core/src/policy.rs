use crate::config::Settings;
use crate::error::{GuardError, Result};
use crate::invocation::{Intent, ToolInvocation};
use crate::state::WorkflowState;
use crate::types::{Phase, Verdict};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EvalContext
// ---------------------------------------------------------------------------

/// Everything a policy may look at. Policies only read; they never mutate.
pub struct EvalContext<'a> {
    pub phase: Phase,
    pub invocation: &'a ToolInvocation,
    pub intent: &'a Intent,
    pub state: &'a WorkflowState,
    pub settings: &'a Settings,
    pub root: &'a std::path::Path,
}

impl<'a> EvalContext<'a> {
    /// Feature the invocation is about: explicit argument, else the active one.
    pub fn target_feature(&self) -> Option<String> {
        let explicit = match self.intent {
            Intent::StartFeature { feature, .. } => Some(feature.as_str()),
            Intent::CompleteFeature { feature }
            | Intent::BlockFeature { feature, .. }
            | Intent::UnblockFeature { feature }
            | Intent::ArchiveFeature { feature }
            | Intent::GenerateTasks { feature, .. }
            | Intent::UpdateTask { feature, .. }
            | Intent::ReopenTask { feature, .. } => feature.as_deref(),
            _ => None,
        };
        self.state.resolve_feature(explicit)
    }

    /// True when an advisory block may be downgraded: either the caller set
    /// `override`/`force`, or overrides need no flag at all.
    pub fn override_granted(&self) -> bool {
        !self.settings.override_requires_flag || self.invocation.has_override()
    }
}

// ---------------------------------------------------------------------------
// Decision / PolicyFinding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: String,
    /// Whether an explicit override flag can turn this block into a warning.
    #[serde(default)]
    pub overridable: bool,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            reason: String::new(),
            overridable: false,
        }
    }

    pub fn warn(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Warn,
            reason: reason.into(),
            overridable: false,
        }
    }

    /// A hard block. No flag changes it.
    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Block,
            reason: reason.into(),
            overridable: false,
        }
    }

    /// An advisory block: `Warn` when an override applies, otherwise `Block`
    /// with instructions for overriding.
    pub fn block_unless(overridden: bool, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if overridden {
            Self {
                verdict: Verdict::Warn,
                reason: format!("{reason} (overridden)"),
                overridable: true,
            }
        } else {
            Self {
                verdict: Verdict::Block,
                reason: format!("{reason}; pass \"override\": true to proceed anyway"),
                overridable: true,
            }
        }
    }

    pub fn is_block(&self) -> bool {
        self.verdict == Verdict::Block
    }
}

/// One policy's non-allow verdict, as reported to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyFinding {
    pub policy: String,
    pub verdict: Verdict,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

pub type PolicyFn = fn(&EvalContext) -> Option<Decision>;

/// A named, prioritised check. `None` from `evaluate` means allow.
///
/// Bounded policies run under the per-policy time budget and degrade to a
/// warning when they exceed it. Unbounded ones run inline and always complete;
/// they are reserved for checks that must never be skipped.
#[derive(Clone, Copy)]
pub struct Policy {
    pub id: &'static str,
    pub phase: Phase,
    pub priority: u32,
    pub bounded: bool,
    pub description: &'static str,
    pub evaluate: PolicyFn,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("priority", &self.priority)
            .field("bounded", &self.bounded)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PolicyRegistry
// ---------------------------------------------------------------------------

/// Policies kept in evaluation order: priority ascending, then registration
/// order.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: Vec<Policy>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in policies.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        for p in crate::policies::default_policies() {
            // Built-in ids are unique.
            let _ = reg.register(p);
        }
        reg
    }

    pub fn register(&mut self, policy: Policy) -> Result<()> {
        if self.policies.iter().any(|p| p.id == policy.id) {
            return Err(GuardError::InvalidInvocation(format!(
                "policy '{}' is already registered",
                policy.id
            )));
        }
        let pos = self
            .policies
            .iter()
            .position(|p| p.priority > policy.priority)
            .unwrap_or(self.policies.len());
        self.policies.insert(pos, policy);
        Ok(())
    }

    pub fn for_phase(&self, phase: Phase) -> impl Iterator<Item = &Policy> {
        self.policies.iter().filter(move |p| p.phase == phase)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: &EvalContext) -> Option<Decision> {
        None
    }

    fn policy(id: &'static str, priority: u32) -> Policy {
        Policy {
            id,
            phase: Phase::Pre,
            priority,
            bounded: true,
            description: "",
            evaluate: never,
        }
    }

    #[test]
    fn registry_orders_by_priority_then_insertion() {
        let mut reg = PolicyRegistry::new();
        reg.register(policy("c", 20)).unwrap();
        reg.register(policy("a", 10)).unwrap();
        reg.register(policy("b", 10)).unwrap();
        let ids: Vec<_> = reg.for_phase(Phase::Pre).map(|p| p.id).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(reg.for_phase(Phase::Post).count(), 0);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut reg = PolicyRegistry::new();
        reg.register(policy("a", 1)).unwrap();
        assert!(reg.register(policy("a", 2)).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn defaults_are_loaded() {
        let reg = PolicyRegistry::with_defaults();
        assert!(reg.len() >= 5);
        let first = reg.for_phase(Phase::Pre).next().unwrap();
        assert_eq!(first.id, "destructive_operation");
        assert!(!first.bounded);
    }

    #[test]
    fn block_unless_downgrades() {
        let d = Decision::block_unless(false, "x");
        assert_eq!(d.verdict, Verdict::Block);
        assert!(d.overridable);
        assert!(d.reason.contains("\"override\": true"));
        let d = Decision::block_unless(true, "x");
        assert_eq!(d.verdict, Verdict::Warn);
        assert!(d.reason.contains("overridden"));
        assert!(!Decision::block("y").overridable);
    }
}
