//! Tool invocations as reported by the hosting assistant, and the intents
//! recognised in them.
//!
//! The core never interprets document text. An invocation is classified by its
//! command id alone (via the built-in table plus `commands:` overrides in the
//! settings), and only the structured arguments the intent needs are read.

use crate::config::Settings;
use crate::error::{GuardError, Result};
use crate::types::{Outcome, Phase, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ToolInvocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    #[serde(rename = "tool", alias = "tool_name", alias = "command_id")]
    pub command_id: String,
    #[serde(default, alias = "tool_input")]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl ToolInvocation {
    pub fn new(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            args: Map::new(),
            phase: None,
            timestamp: Utc::now(),
            outcome: None,
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let inv: ToolInvocation = serde_json::from_str(data)?;
        if inv.command_id.trim().is_empty() {
            return Err(GuardError::InvalidInvocation("empty tool name".to_string()));
        }
        Ok(inv)
    }

    /// Outcome as reported, assuming success when the host omitted it.
    pub fn effective_outcome(&self) -> Outcome {
        self.outcome.unwrap_or(Outcome::Success)
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str).map(str::trim)
    }

    pub fn first_str_arg(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.str_arg(k)).filter(|s| !s.is_empty())
    }

    /// Truthy flag: `true`, `"true"`, `"yes"` or `1`.
    pub fn flag(&self, key: &str) -> bool {
        match self.args.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "yes" | "1"),
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => false,
        }
    }

    /// Whether the caller explicitly asked to override an advisory block.
    pub fn has_override(&self) -> bool {
        self.flag("override") || self.flag("force")
    }
}

// ---------------------------------------------------------------------------
// IntentKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    StartFeature,
    CompleteFeature,
    BlockFeature,
    UnblockFeature,
    ArchiveFeature,
    GenerateTasks,
    UpdateTask,
    ReopenTask,
    RecordTest,
    FileWrite,
    Shell,
    None,
}

impl IntentKind {
    /// Built-in command table.
    pub fn builtin(command_id: &str) -> IntentKind {
        match command_id {
            "start_feature" => IntentKind::StartFeature,
            "complete_feature" => IntentKind::CompleteFeature,
            "block_feature" => IntentKind::BlockFeature,
            "unblock_feature" => IntentKind::UnblockFeature,
            "archive_feature" => IntentKind::ArchiveFeature,
            "generate_tasks" => IntentKind::GenerateTasks,
            "update_task" => IntentKind::UpdateTask,
            "reopen_task" => IntentKind::ReopenTask,
            "record_test" => IntentKind::RecordTest,
            "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => IntentKind::FileWrite,
            "Bash" => IntentKind::Shell,
            _ => IntentKind::None,
        }
    }

    pub fn resolve(command_id: &str, settings: &Settings) -> IntentKind {
        settings
            .commands
            .get(command_id)
            .copied()
            .unwrap_or_else(|| IntentKind::builtin(command_id))
    }
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// One item of a bulk task-generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    StartFeature {
        feature: String,
        branch: Option<String>,
        linked_issue: Option<String>,
        test_ref: Option<String>,
    },
    CompleteFeature {
        feature: Option<String>,
    },
    BlockFeature {
        feature: Option<String>,
        reason: String,
    },
    UnblockFeature {
        feature: Option<String>,
    },
    ArchiveFeature {
        feature: Option<String>,
    },
    GenerateTasks {
        feature: Option<String>,
        items: Vec<TaskSpec>,
    },
    UpdateTask {
        feature: Option<String>,
        task: String,
        status: TaskStatus,
        test_ref: Option<String>,
    },
    ReopenTask {
        feature: Option<String>,
        task: String,
    },
    RecordTest {
        test_ref: Option<String>,
        outcome: Outcome,
    },
    FileWrite {
        paths: Vec<String>,
    },
    Shell {
        command: String,
    },
    Other,
}

const FEATURE_KEYS: &[&str] = &["feature", "feature_id", "id", "name"];
const PATH_KEYS: &[&str] = &["file_path", "path", "notebook_path"];

impl Intent {
    /// Classify `inv`. Malformed arguments for a recognised command are an
    /// error so callers can report them instead of silently ignoring the call.
    pub fn classify(inv: &ToolInvocation, settings: &Settings) -> Result<Intent> {
        let feature = || inv.first_str_arg(FEATURE_KEYS).map(str::to_string);
        let missing = |what: &str| {
            GuardError::InvalidInvocation(format!("'{}' requires '{what}'", inv.command_id))
        };

        let intent = match IntentKind::resolve(&inv.command_id, settings) {
            IntentKind::StartFeature => Intent::StartFeature {
                feature: feature().ok_or_else(|| missing("feature"))?,
                branch: inv.first_str_arg(&["branch", "branch_name"]).map(str::to_string),
                linked_issue: inv.first_str_arg(&["issue", "linked_issue"]).map(str::to_string),
                test_ref: inv.first_str_arg(&["test_ref", "tests"]).map(str::to_string),
            },
            IntentKind::CompleteFeature => Intent::CompleteFeature { feature: feature() },
            IntentKind::BlockFeature => Intent::BlockFeature {
                feature: feature(),
                reason: inv
                    .first_str_arg(&["reason"])
                    .unwrap_or("blocked")
                    .to_string(),
            },
            IntentKind::UnblockFeature => Intent::UnblockFeature { feature: feature() },
            IntentKind::ArchiveFeature => Intent::ArchiveFeature { feature: feature() },
            IntentKind::GenerateTasks => Intent::GenerateTasks {
                feature: feature(),
                items: task_specs(inv).ok_or_else(|| missing("tasks"))?,
            },
            IntentKind::UpdateTask => {
                let status = inv.first_str_arg(&["status"]).ok_or_else(|| missing("status"))?;
                Intent::UpdateTask {
                    feature: feature(),
                    task: inv
                        .first_str_arg(&["task", "task_id"])
                        .ok_or_else(|| missing("task"))?
                        .to_string(),
                    status: TaskStatus::from_str(status)?,
                    test_ref: inv.first_str_arg(&["test_ref"]).map(str::to_string),
                }
            }
            IntentKind::ReopenTask => Intent::ReopenTask {
                feature: feature(),
                task: inv
                    .first_str_arg(&["task", "task_id"])
                    .ok_or_else(|| missing("task"))?
                    .to_string(),
            },
            IntentKind::RecordTest => {
                let outcome = match inv.first_str_arg(&["outcome", "result"]) {
                    Some(s) => Outcome::from_str(s)?,
                    None => inv.effective_outcome(),
                };
                Intent::RecordTest {
                    test_ref: inv.first_str_arg(&["test_ref", "id"]).map(str::to_string),
                    outcome,
                }
            }
            IntentKind::FileWrite => Intent::FileWrite {
                paths: PATH_KEYS
                    .iter()
                    .filter_map(|k| inv.str_arg(k))
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            IntentKind::Shell => Intent::Shell {
                command: inv.first_str_arg(&["command", "cmd"]).unwrap_or("").to_string(),
            },
            IntentKind::None => Intent::Other,
        };
        Ok(intent)
    }

    /// Like [`Intent::classify`] but never fails: malformed calls become
    /// `Other` and are logged.
    pub fn classify_lenient(inv: &ToolInvocation, settings: &Settings) -> Intent {
        Intent::classify(inv, settings).unwrap_or_else(|e| {
            tracing::debug!(tool = %inv.command_id, "unclassified invocation: {e}");
            Intent::Other
        })
    }

    /// The command id used for suggestions and learned transitions. Shell
    /// test runs are folded into `run_tests` so they join the workflow graph.
    pub fn workflow_command(&self, inv: &ToolInvocation, settings: &Settings) -> String {
        match self {
            Intent::Shell { command } if settings.guard.is_test_command(command) => {
                "run_tests".to_string()
            }
            _ => inv.command_id.clone(),
        }
    }
}

/// `tasks` may be a list of strings or of `{description, test_ref}` objects.
fn task_specs(inv: &ToolInvocation) -> Option<Vec<TaskSpec>> {
    let items = inv.args.get("tasks").or_else(|| inv.args.get("items"))?;
    let list = items.as_array()?;
    let specs: Vec<TaskSpec> = list
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(TaskSpec {
                description: s.trim().to_string(),
                test_ref: None,
            }),
            Value::Object(_) => serde_json::from_value(item.clone()).ok(),
            _ => None,
        })
        .collect();
    if specs.is_empty() {
        None
    } else {
        Some(specs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn parses_host_schema() {
        let inv = ToolInvocation::from_json(
            r#"{"tool":"Bash","args":{"command":"ls"},"phase":"pre","timestamp":"2026-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        assert_eq!(inv.command_id, "Bash");
        assert_eq!(inv.phase, Some(Phase::Pre));
        assert_eq!(inv.str_arg("command"), Some("ls"));
    }

    #[test]
    fn parses_hook_field_names() {
        let inv = ToolInvocation::from_json(
            r#"{"tool_name":"Write","tool_input":{"file_path":"src/a.rs"}}"#,
        )
        .unwrap();
        assert_eq!(inv.command_id, "Write");
        assert!(inv.outcome.is_none());
        assert_eq!(inv.effective_outcome(), Outcome::Success);
    }

    #[test]
    fn rejects_empty_tool() {
        assert!(ToolInvocation::from_json(r#"{"tool":"  "}"#).is_err());
    }

    #[test]
    fn override_flag_forms() {
        assert!(ToolInvocation::new("x").arg("override", true).has_override());
        assert!(ToolInvocation::new("x").arg("force", "yes").has_override());
        assert!(!ToolInvocation::new("x").arg("override", false).has_override());
        assert!(!ToolInvocation::new("x").has_override());
    }

    #[test]
    fn classify_start_feature() {
        let inv = ToolInvocation::new("start_feature")
            .arg("feature", "auth")
            .arg("issue", "GH-12");
        match Intent::classify(&inv, &settings()).unwrap() {
            Intent::StartFeature {
                feature,
                linked_issue,
                branch,
                ..
            } => {
                assert_eq!(feature, "auth");
                assert_eq!(linked_issue.as_deref(), Some("GH-12"));
                assert!(branch.is_none());
            }
            other => panic!("unexpected intent {other:?}"),
        }
    }

    #[test]
    fn classify_start_feature_without_id_fails() {
        let inv = ToolInvocation::new("start_feature");
        assert!(Intent::classify(&inv, &settings()).is_err());
        assert_eq!(Intent::classify_lenient(&inv, &settings()), Intent::Other);
    }

    #[test]
    fn classify_generate_tasks_mixed_items() {
        let inv = ToolInvocation::new("generate_tasks").arg(
            "tasks",
            json!(["write schema", {"description": "wire api", "test_ref": "api-tests"}, 7]),
        );
        match Intent::classify(&inv, &settings()).unwrap() {
            Intent::GenerateTasks { items, feature } => {
                assert!(feature.is_none());
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].test_ref.as_deref(), Some("api-tests"));
            }
            other => panic!("unexpected intent {other:?}"),
        }
    }

    #[test]
    fn classify_update_task_rejects_unknown_status() {
        let inv = ToolInvocation::new("update_task")
            .arg("task", "T1")
            .arg("status", "finished-ish");
        assert!(Intent::classify(&inv, &settings()).is_err());
    }

    #[test]
    fn classify_file_write_collects_paths() {
        let inv = ToolInvocation::new("Edit").arg("file_path", "src/lib.rs");
        assert_eq!(
            Intent::classify(&inv, &settings()).unwrap(),
            Intent::FileWrite {
                paths: vec!["src/lib.rs".to_string()]
            }
        );
    }

    #[test]
    fn command_overrides_apply() {
        let mut s = settings();
        s.commands
            .insert("/feature-start".to_string(), IntentKind::StartFeature);
        s.commands.insert("Bash".to_string(), IntentKind::None);
        let inv = ToolInvocation::new("/feature-start").arg("feature", "f1");
        assert!(matches!(
            Intent::classify(&inv, &s).unwrap(),
            Intent::StartFeature { .. }
        ));
        let bash = ToolInvocation::new("Bash").arg("command", "rm -rf /");
        assert_eq!(Intent::classify(&bash, &s).unwrap(), Intent::Other);
    }

    #[test]
    fn test_runs_fold_into_run_tests() {
        let s = settings();
        let inv = ToolInvocation::new("Bash").arg("command", "cargo test -p core");
        let intent = Intent::classify(&inv, &s).unwrap();
        assert_eq!(intent.workflow_command(&inv, &s), "run_tests");

        let other = ToolInvocation::new("Bash").arg("command", "ls");
        let intent = Intent::classify(&other, &s).unwrap();
        assert_eq!(intent.workflow_command(&other, &s), "Bash");
    }
}
