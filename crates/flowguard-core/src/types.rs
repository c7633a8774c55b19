use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Where in the tool-call lifecycle an invocation is being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Pre,
    Post,
    #[serde(alias = "stop")]
    OnStop,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Post => "post",
            Phase::OnStop => "on-stop",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = crate::error::GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre" => Ok(Phase::Pre),
            "post" => Ok(Phase::Post),
            "on-stop" | "on_stop" | "stop" => Ok(Phase::OnStop),
            _ => Err(crate::error::GuardError::InvalidPhase(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Ordered by severity: `Allow < Warn < Block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Warn,
    Block,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Warn => "warn",
            Verdict::Block => "block",
        }
    }

    /// Process exit code for the standalone `evaluate` entry point.
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Allow => 0,
            Verdict::Block => 1,
            Verdict::Warn => 2,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Blocked,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Outcome {
    type Err = crate::error::GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "success" | "pass" | "passed" | "ok" => Ok(Outcome::Success),
            "failure" | "fail" | "failed" | "error" => Ok(Outcome::Failure),
            "blocked" => Ok(Outcome::Blocked),
            _ => Err(crate::error::GuardError::InvalidInvocation(format!(
                "unknown outcome '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// FeatureStatus / FeatureEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Planned,
    Active,
    Blocked,
    Completed,
    Archived,
}

impl FeatureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureStatus::Planned => "planned",
            FeatureStatus::Active => "active",
            FeatureStatus::Blocked => "blocked",
            FeatureStatus::Completed => "completed",
            FeatureStatus::Archived => "archived",
        }
    }

    /// The structural transition table. Anything not listed is illegal,
    /// regardless of what any policy decided.
    pub fn next(self, event: FeatureEvent) -> Option<FeatureStatus> {
        use FeatureEvent as E;
        use FeatureStatus as S;
        match (self, event) {
            (S::Planned, E::Start) => Some(S::Active),
            (S::Active, E::Block) => Some(S::Blocked),
            (S::Blocked, E::Unblock) => Some(S::Active),
            (S::Active, E::Complete) => Some(S::Completed),
            (S::Completed, E::Archive) => Some(S::Archived),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FeatureStatus::Archived)
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureEvent {
    Start,
    Block,
    Unblock,
    Complete,
    Archive,
}

impl FeatureEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureEvent::Start => "start",
            FeatureEvent::Block => "block",
            FeatureEvent::Unblock => "unblock",
            FeatureEvent::Complete => "complete",
            FeatureEvent::Archive => "archive",
        }
    }
}

impl fmt::Display for FeatureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Generated,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    /// Progress rank. `Blocked` sits alongside `InProgress`: a task can bounce
    /// between the two, but never drop back to `Generated`.
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Generated => 0,
            TaskStatus::InProgress | TaskStatus::Blocked => 1,
            TaskStatus::Completed => 2,
        }
    }

    /// True when moving to `to` does not regress. Leaving `Completed` is only
    /// possible through an explicit reopen.
    pub fn can_advance_to(self, to: TaskStatus) -> bool {
        if self == TaskStatus::Completed {
            return to == TaskStatus::Completed;
        }
        to.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Generated => "generated",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::error::GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" | "pending" => Ok(TaskStatus::Generated),
            "in_progress" | "in-progress" | "started" => Ok(TaskStatus::InProgress),
            "completed" | "done" => Ok(TaskStatus::Completed),
            "blocked" => Ok(TaskStatus::Blocked),
            _ => Err(crate::error::GuardError::InvalidInvocation(format!(
                "unknown task status '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn verdict_severity_order() {
        assert!(Verdict::Allow < Verdict::Warn);
        assert!(Verdict::Warn < Verdict::Block);
    }

    #[test]
    fn verdict_exit_codes() {
        assert_eq!(Verdict::Allow.exit_code(), 0);
        assert_eq!(Verdict::Block.exit_code(), 1);
        assert_eq!(Verdict::Warn.exit_code(), 2);
    }

    #[test]
    fn phase_parses_stop_aliases() {
        assert_eq!(Phase::from_str("on-stop").unwrap(), Phase::OnStop);
        assert_eq!(Phase::from_str("stop").unwrap(), Phase::OnStop);
        assert!(Phase::from_str("during").is_err());
    }

    #[test]
    fn phase_serializes_kebab() {
        assert_eq!(serde_json::to_string(&Phase::OnStop).unwrap(), "\"on-stop\"");
    }

    #[test]
    fn feature_transition_table() {
        use FeatureEvent as E;
        use FeatureStatus as S;
        assert_eq!(S::Planned.next(E::Start), Some(S::Active));
        assert_eq!(S::Active.next(E::Block), Some(S::Blocked));
        assert_eq!(S::Blocked.next(E::Unblock), Some(S::Active));
        assert_eq!(S::Active.next(E::Complete), Some(S::Completed));
        assert_eq!(S::Completed.next(E::Archive), Some(S::Archived));

        assert_eq!(S::Planned.next(E::Complete), None);
        assert_eq!(S::Blocked.next(E::Complete), None);
        assert_eq!(S::Archived.next(E::Start), None);
        assert_eq!(S::Completed.next(E::Start), None);
    }

    #[test]
    fn task_status_never_regresses() {
        use TaskStatus as T;
        assert!(T::Generated.can_advance_to(T::InProgress));
        assert!(T::Generated.can_advance_to(T::Completed));
        assert!(T::InProgress.can_advance_to(T::Blocked));
        assert!(T::Blocked.can_advance_to(T::InProgress));
        assert!(!T::InProgress.can_advance_to(T::Generated));
        assert!(!T::Completed.can_advance_to(T::InProgress));
        assert!(T::Completed.can_advance_to(T::Completed));
    }

    #[test]
    fn outcome_accepts_test_runner_words() {
        assert_eq!(Outcome::from_str("passed").unwrap(), Outcome::Success);
        assert_eq!(Outcome::from_str("FAIL").unwrap(), Outcome::Failure);
        assert!(Outcome::from_str("maybe").is_err());
    }
}
