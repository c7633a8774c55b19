use crate::error::TaskLedgerError;
use crate::invocation::TaskSpec;
use crate::types::{Outcome, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type TestRecords = BTreeMap<String, TestRecord>;

// ---------------------------------------------------------------------------
// TestRecord
// ---------------------------------------------------------------------------

/// Last known result for one test reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: String,
    pub outcome: Outcome,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl TestRecord {
    pub fn new(id: impl Into<String>, outcome: Outcome, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            outcome,
            recorded_at: at,
            command: None,
            extra: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Generated,
            test_ref: None,
            created_at: at,
            updated_at: at,
            extra: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskLedger
// ---------------------------------------------------------------------------

/// Ordered sub-tasks of one feature. Tasks are appended and updated, never
/// removed; the ledger is archived together with its feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLedger {
    pub id: String,
    pub feature_id: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub archived: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl TaskLedger {
    pub fn new(id: impl Into<String>, feature_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            feature_id: feature_id.into(),
            tasks: Vec::new(),
            archived: false,
            extra: BTreeMap::new(),
        }
    }

    /// Bulk-append tasks. IDs continue the `T<n>` sequence, so they stay unique
    /// and never change once issued. Returns the new IDs.
    pub fn generate_tasks(&mut self, items: &[TaskSpec], at: DateTime<Utc>) -> Vec<String> {
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = format!("T{}", self.tasks.len() + 1);
            let mut task = Task::new(id.clone(), item.description.clone(), at);
            task.test_ref = item.test_ref.clone();
            self.tasks.push(task);
            ids.push(id);
        }
        ids
    }

    /// Move a task forward. Regressions are refused (see [`TaskLedger::reopen_task`]),
    /// and completion is refused while the task's test record reports anything
    /// but success. On error the task is left exactly as it was.
    pub fn update_task_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        test_ref: Option<&str>,
        tests: &TestRecords,
        at: DateTime<Utc>,
    ) -> Result<Task, TaskLedgerError> {
        let task = self.find_mut(task_id)?;

        if !task.status.can_advance_to(status) {
            return Err(TaskLedgerError::IllegalTransition {
                task: task_id.to_string(),
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }

        let effective_ref = test_ref.map(str::to_string).or_else(|| task.test_ref.clone());
        if status == TaskStatus::Completed {
            if let Some(r) = &effective_ref {
                if let Some(record) = tests.get(r) {
                    if !record.outcome.is_success() {
                        return Err(TaskLedgerError::TestNotPassing {
                            task: task_id.to_string(),
                            test_ref: r.clone(),
                        });
                    }
                }
            }
        }

        task.status = status;
        task.test_ref = effective_ref;
        task.updated_at = at;
        Ok(task.clone())
    }

    /// The one sanctioned way backwards: `Completed` or `Blocked` → `InProgress`.
    pub fn reopen_task(&mut self, task_id: &str, at: DateTime<Utc>) -> Result<Task, TaskLedgerError> {
        let task = self.find_mut(task_id)?;
        if task.status == TaskStatus::Generated {
            return Err(TaskLedgerError::IllegalTransition {
                task: task_id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::InProgress.to_string(),
            });
        }
        task.status = TaskStatus::InProgress;
        task.updated_at = at;
        Ok(task.clone())
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// `completed / total`, computed from the tasks on every call. An empty
    /// ledger has nothing outstanding and reports 1.0.
    pub fn completion_ratio(&self) -> f64 {
        if self.tasks.is_empty() {
            return 1.0;
        }
        self.count(TaskStatus::Completed) as f64 / self.tasks.len() as f64
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    /// First task that still needs work, in ledger order.
    pub fn next_task(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| matches!(t.status, TaskStatus::InProgress | TaskStatus::Generated))
    }

    /// Human-readable summary: "3/5 completed, 1 in progress, 1 blocked"
    pub fn summarize(&self) -> String {
        format!(
            "{}/{} completed, {} in progress, {} blocked",
            self.count(TaskStatus::Completed),
            self.tasks.len(),
            self.count(TaskStatus::InProgress),
            self.count(TaskStatus::Blocked)
        )
    }

    fn find_mut(&mut self, task_id: &str) -> Result<&mut Task, TaskLedgerError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| TaskLedgerError::TaskNotFound(task_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
