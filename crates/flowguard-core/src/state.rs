use crate::config::Settings;
use crate::error::{GuardError, Result, TaskLedgerError};
use crate::feature::Feature;
use crate::invocation::TaskSpec;
use crate::learned::LearnedTransitions;
use crate::paths;
use crate::session::{InvocationRecord, SessionContext, ShownSuggestions};
use crate::task::{Task, TaskLedger, TestRecord, TestRecords};
use crate::types::{FeatureEvent, FeatureStatus, Outcome, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// A single change to [`WorkflowState`]. Everything that writes state goes
/// through [`WorkflowState::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    TouchSession {
        at: DateTime<Utc>,
    },
    EndSession {
        at: DateTime<Utc>,
    },
    RecordInvocation(InvocationRecord),
    CreateFeature {
        id: String,
        branch: Option<String>,
        at: DateTime<Utc>,
    },
    Transition {
        feature: String,
        event: FeatureEvent,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    LinkIssue {
        feature: String,
        issue: String,
    },
    BindTestRef {
        feature: String,
        test_ref: String,
    },
    GenerateTasks {
        feature: String,
        items: Vec<TaskSpec>,
        at: DateTime<Utc>,
    },
    UpdateTask {
        feature: String,
        task: String,
        status: TaskStatus,
        test_ref: Option<String>,
        at: DateTime<Utc>,
    },
    ReopenTask {
        feature: String,
        task: String,
        at: DateTime<Utc>,
    },
    RecordTest {
        test_ref: String,
        outcome: Outcome,
        command: Option<String>,
        at: DateTime<Utc>,
    },
    TouchFiles {
        feature: String,
        paths: Vec<String>,
    },
    LearnTransition {
        from: String,
        to: String,
    },
    ShowSuggestions(ShownSuggestions),
    ConsumeSuggestions,
    ResetLearned,
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_feature: Option<String>,
    #[serde(default)]
    pub features: BTreeMap<String, Feature>,
    #[serde(default)]
    pub ledgers: BTreeMap<String, TaskLedger>,
    #[serde(default)]
    pub test_records: TestRecords,
    #[serde(default)]
    pub session: SessionContext,
    #[serde(default, skip_serializing_if = "LearnedTransitions::is_empty")]
    pub learned: LearnedTransitions,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowState {
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            revision: 0,
            active_feature: None,
            features: BTreeMap::new(),
            ledgers: BTreeMap::new(),
            test_records: TestRecords::new(),
            session: SessionContext::default(),
            learned: LearnedTransitions::new(),
            extra: BTreeMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load and validate the state file. Missing file → `NotInitialized`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::state_path(root);
        if !path.exists() {
            return Err(GuardError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        Self::from_yaml(&data)
    }

    /// Load the state file, never failing. A missing file yields an empty
    /// state; an unreadable or inconsistent one is moved aside to
    /// `state.yaml.corrupt-<timestamp>` and replaced by an empty state.
    pub fn load_or_recover(root: &Path) -> Self {
        match Self::load(root) {
            Ok(state) => state,
            Err(GuardError::NotInitialized) => Self::new(),
            Err(e @ (GuardError::Yaml(_) | GuardError::StateCorruption(_))) => {
                let path = paths::state_path(root);
                let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
                match crate::io::quarantine(&path, &suffix) {
                    Ok(moved) => tracing::warn!(
                        "state file is corrupt ({e}); starting from empty state, old file kept at {}",
                        moved.display()
                    ),
                    Err(qe) => tracing::warn!(
                        "state file is corrupt ({e}); starting from empty state (could not move it aside: {qe})"
                    ),
                }
                Self::new()
            }
            Err(e) => {
                tracing::warn!("could not read state file ({e}); starting from empty state");
                Self::new()
            }
        }
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let state: WorkflowState = serde_yaml::from_str(data)?;
        if state.schema_version > SCHEMA_VERSION {
            tracing::warn!(
                found = state.schema_version,
                supported = SCHEMA_VERSION,
                "state file was written by a newer version"
            );
        }
        state.validate()?;
        Ok(state)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::state_path(root);
        let data = self.to_yaml()?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Cross-reference checks run on every load.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |msg: String| Err(GuardError::StateCorruption(msg));

        for (key, feature) in &self.features {
            if key != &feature.id {
                return corrupt(format!("feature key '{key}' does not match id '{}'", feature.id));
            }
            if !self.ledgers.contains_key(&feature.ledger_id) {
                return corrupt(format!(
                    "feature '{key}' references missing ledger '{}'",
                    feature.ledger_id
                ));
            }
        }
        for (key, ledger) in &self.ledgers {
            if !self.features.contains_key(&ledger.feature_id) {
                return corrupt(format!(
                    "ledger '{key}' belongs to unknown feature '{}'",
                    ledger.feature_id
                ));
            }
            let mut seen = BTreeSet::new();
            for task in &ledger.tasks {
                if !seen.insert(task.id.as_str()) {
                    return corrupt(format!("ledger '{key}' has duplicate task '{}'", task.id));
                }
            }
        }
        if let Some(active) = &self.active_feature {
            match self.features.get(active) {
                Some(f) if f.is_active() => {}
                Some(f) => {
                    return corrupt(format!(
                        "active feature '{active}' has status {}",
                        f.status
                    ))
                }
                None => return corrupt(format!("active feature '{active}' does not exist")),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.features.get(id)
    }

    /// `explicit` when given, otherwise the active feature.
    pub fn resolve_feature(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::to_string)
            .or_else(|| self.active_feature.clone())
    }

    pub fn ledger_for(&self, feature_id: &str) -> Option<&TaskLedger> {
        let feature = self.features.get(feature_id)?;
        self.ledgers.get(&feature.ledger_id)
    }

    pub fn active_features(&self) -> impl Iterator<Item = &Feature> {
        self.features.values().filter(|f| f.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active_features().count()
    }

    /// Ratio for the feature's ledger; a feature without tasks reports 1.0.
    pub fn completion_ratio(&self, feature_id: &str) -> f64 {
        self.ledger_for(feature_id)
            .map(TaskLedger::completion_ratio)
            .unwrap_or(1.0)
    }

    pub fn test_outcome(&self, test_ref: &str) -> Option<Outcome> {
        self.test_records.get(test_ref).map(|r| r.outcome)
    }

    /// Reasons the feature may not complete yet: unfinished tasks, or an
    /// associated test that has not passed. Empty when completion is allowed.
    pub fn completion_blockers(&self, feature_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let Some(feature) = self.features.get(feature_id) else {
            return out;
        };
        if let Some(ledger) = self.ledgers.get(&feature.ledger_id) {
            if !ledger.is_complete() {
                out.push(format!(
                    "tasks incomplete for '{feature_id}': {}",
                    ledger.summarize()
                ));
            }
        }
        if let Some(test_ref) = &feature.test_ref {
            match self.test_outcome(test_ref) {
                Some(Outcome::Success) => {}
                Some(outcome) => out.push(format!("test '{test_ref}' last reported {outcome}")),
                None => out.push(format!("test '{test_ref}' has not been run")),
            }
        }
        out
    }

    /// The most recently transitioned active feature other than `except`.
    fn most_recent_active(&self, except: &str) -> Option<String> {
        self.active_features()
            .filter(|f| f.id != except)
            .max_by_key(|f| f.last_transition_at)
            .map(|f| f.id.clone())
    }

    fn ledger_mut(&mut self, feature_id: &str) -> Result<&mut TaskLedger> {
        let ledger_id = self
            .features
            .get(feature_id)
            .map(|f| f.ledger_id.clone())
            .ok_or_else(|| GuardError::FeatureNotFound(feature_id.to_string()))?;
        self.ledgers
            .get_mut(&ledger_id)
            .ok_or_else(|| TaskLedgerError::LedgerNotFound(ledger_id).into())
    }

    fn feature_mut(&mut self, feature_id: &str) -> Result<&mut Feature> {
        self.features
            .get_mut(feature_id)
            .ok_or_else(|| GuardError::FeatureNotFound(feature_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Apply one mutation. On error `self` may be partially modified; callers
    /// that need all-or-nothing apply to a clone (see `StateStore::commit`).
    pub fn apply(&mut self, mutation: Mutation, settings: &Settings) -> Result<()> {
        match mutation {
            Mutation::TouchSession { at } => {
                self.session
                    .recent
                    .set_capacity(settings.session.history_capacity);
                if self.session.touch(at, settings.session.idle_timeout_minutes) {
                    tracing::debug!("new session started");
                }
            }
            Mutation::EndSession { at } => self.session.end(at),
            Mutation::RecordInvocation(record) => {
                self.session
                    .recent
                    .set_capacity(settings.session.history_capacity);
                self.session.recent.push(record);
            }
            Mutation::CreateFeature { id, branch, at } => {
                paths::validate_feature_id(&id)?;
                if self.features.contains_key(&id) {
                    return Err(GuardError::InvalidInvocation(format!(
                        "feature '{id}' already exists"
                    )));
                }
                let feature = Feature::new(id.clone(), branch, at);
                self.ledgers
                    .entry(feature.ledger_id.clone())
                    .or_insert_with(|| TaskLedger::new(feature.ledger_id.clone(), id.clone()));
                self.features.insert(id, feature);
            }
            Mutation::Transition {
                feature,
                event,
                reason,
                at,
            } => {
                let f = self.feature_mut(&feature)?;
                f.apply_event(event, reason, at)?;
                let status = f.status;
                let ledger_id = f.ledger_id.clone();
                match status {
                    FeatureStatus::Active => {
                        self.active_feature = Some(feature.clone());
                        self.session.focus = Some(feature);
                    }
                    FeatureStatus::Blocked | FeatureStatus::Completed => {
                        if self.active_feature.as_deref() == Some(feature.as_str()) {
                            self.active_feature = self.most_recent_active(&feature);
                        }
                    }
                    FeatureStatus::Archived => {
                        if let Some(ledger) = self.ledgers.get_mut(&ledger_id) {
                            ledger.archived = true;
                        }
                        if self.session.focus.as_deref() == Some(feature.as_str()) {
                            self.session.reset(at);
                        }
                    }
                    FeatureStatus::Planned => {}
                }
            }
            Mutation::LinkIssue { feature, issue } => {
                self.feature_mut(&feature)?.linked_issue = Some(issue);
            }
            Mutation::BindTestRef { feature, test_ref } => {
                self.feature_mut(&feature)?.test_ref = Some(test_ref);
            }
            Mutation::GenerateTasks { feature, items, at } => {
                let ledger = self.ledger_mut(&feature)?;
                if ledger.archived {
                    return Err(GuardError::InvalidInvocation(format!(
                        "ledger for '{feature}' is archived"
                    )));
                }
                let ids = ledger.generate_tasks(&items, at);
                tracing::debug!(feature = %feature, count = ids.len(), "tasks generated");
            }
            Mutation::UpdateTask {
                feature,
                task,
                status,
                test_ref,
                at,
            } => {
                let tests = &self.test_records;
                let ledger_id = self
                    .features
                    .get(&feature)
                    .map(|f| f.ledger_id.clone())
                    .ok_or_else(|| GuardError::FeatureNotFound(feature.clone()))?;
                let ledger = self
                    .ledgers
                    .get_mut(&ledger_id)
                    .ok_or(TaskLedgerError::LedgerNotFound(ledger_id))?;
                ledger.update_task_status(&task, status, test_ref.as_deref(), tests, at)?;
            }
            Mutation::ReopenTask { feature, task, at } => {
                self.ledger_mut(&feature)?.reopen_task(&task, at)?;
            }
            Mutation::RecordTest {
                test_ref,
                outcome,
                command,
                at,
            } => {
                let mut record = TestRecord::new(test_ref.clone(), outcome, at);
                record.command = command;
                self.test_records.insert(test_ref, record);
            }
            Mutation::TouchFiles { feature, paths } => {
                self.feature_mut(&feature)?.files_touched.extend(paths);
            }
            Mutation::LearnTransition { from, to } => {
                self.learned
                    .record(&from, &to, settings.suggestions.decay_threshold);
            }
            Mutation::ShowSuggestions(shown) => self.session.shown = Some(shown),
            Mutation::ConsumeSuggestions => self.session.shown = None,
            Mutation::ResetLearned => self.learned.clear(),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Direct operations
    // -----------------------------------------------------------------------

    /// Append tasks to a feature's ledger and return the updated ledger.
    pub fn generate_tasks(
        &mut self,
        feature_id: &str,
        items: Vec<TaskSpec>,
        settings: &Settings,
    ) -> Result<&TaskLedger> {
        self.apply(
            Mutation::GenerateTasks {
                feature: feature_id.to_string(),
                items,
                at: Utc::now(),
            },
            settings,
        )?;
        self.ledger_for(feature_id)
            .ok_or_else(|| TaskLedgerError::LedgerNotFound(feature_id.to_string()).into())
    }

    /// Move one task forward and return it. Failures leave every task as it was.
    pub fn update_task_status(
        &mut self,
        feature_id: &str,
        task_id: &str,
        status: TaskStatus,
        test_ref: Option<&str>,
    ) -> std::result::Result<Task, TaskLedgerError> {
        let tests = &self.test_records;
        let ledger_id = self
            .features
            .get(feature_id)
            .map(|f| f.ledger_id.clone())
            .ok_or_else(|| TaskLedgerError::LedgerNotFound(feature_id.to_string()))?;
        let ledger = self
            .ledgers
            .get_mut(&ledger_id)
            .ok_or(TaskLedgerError::LedgerNotFound(ledger_id))?;
        ledger.update_task_status(task_id, status, test_ref, tests, Utc::now())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
