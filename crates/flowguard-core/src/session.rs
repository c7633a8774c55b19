use crate::invocation::ToolInvocation;
use crate::types::{Outcome, Phase};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};

/// Longest string argument kept in the history before it is truncated.
const MAX_ARG_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// BoundedQueue
// ---------------------------------------------------------------------------

/// FIFO ring buffer: pushing past capacity evicts the oldest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedQueue<T> {
    capacity: usize,
    #[serde(default = "VecDeque::new")]
    items: VecDeque<T>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
            extra: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, item: T) {
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Shrinking drops the oldest entries.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(50)
    }
}

// ---------------------------------------------------------------------------
// InvocationRecord
// ---------------------------------------------------------------------------

/// A history entry: the invocation as received, with long string arguments
/// truncated, plus the workflow command it counted as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub tool: String,
    pub command: String,
    pub phase: Phase,
    pub outcome: Outcome,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl InvocationRecord {
    pub fn from_invocation(
        inv: &ToolInvocation,
        command: &str,
        phase: Phase,
        outcome: Outcome,
    ) -> Self {
        Self {
            tool: inv.command_id.clone(),
            command: command.to_string(),
            phase,
            outcome,
            at: inv.timestamp,
            args: compact_args(&inv.args),
            note: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

fn compact_args(args: &Map<String, Value>) -> Map<String, Value> {
    args.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) if s.chars().count() > MAX_ARG_CHARS => {
                    let cut: String = s.chars().take(MAX_ARG_CHARS).collect();
                    Value::String(format!("{cut}…"))
                }
                Value::Array(_) | Value::Object(_) if v.to_string().len() > MAX_ARG_CHARS => {
                    Value::String("<elided>".to_string())
                }
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ShownSuggestions
// ---------------------------------------------------------------------------

/// The suggestions most recently emitted, kept until the next command so a
/// match can be counted as a learned transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShownSuggestions {
    pub after: String,
    pub commands: Vec<String>,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ShownSuggestions {
    pub fn new(after: impl Into<String>, commands: Vec<String>, at: DateTime<Utc>) -> Self {
        Self {
            after: after.into(),
            commands,
            at,
            extra: BTreeMap::new(),
        }
    }

    pub fn contains(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }
}

// ---------------------------------------------------------------------------
// SessionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    #[serde(default)]
    pub recent: BoundedQueue<InvocationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shown: Option<ShownSuggestions>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl SessionContext {
    /// True when the next activity at `now` should open a new session.
    pub fn needs_new_session(&self, now: DateTime<Utc>, idle_timeout_minutes: u32) -> bool {
        if self.started_at.is_none() || self.ended_at.is_some() {
            return true;
        }
        match self.last_activity_at {
            Some(last) => now - last > Duration::minutes(i64::from(idle_timeout_minutes)),
            None => true,
        }
    }

    /// Record activity at `now`. Returns true when this started a new
    /// session. A new session forgets pending suggestions but keeps history.
    pub fn touch(&mut self, now: DateTime<Utc>, idle_timeout_minutes: u32) -> bool {
        let fresh = self.needs_new_session(now, idle_timeout_minutes);
        if fresh {
            self.started_at = Some(now);
            self.ended_at = None;
            self.shown = None;
        }
        if self.last_activity_at.map_or(true, |last| now > last) {
            self.last_activity_at = Some(now);
        }
        fresh
    }

    pub fn end(&mut self, now: DateTime<Utc>) {
        self.ended_at = Some(now);
        self.shown = None;
    }

    /// Forget everything about the current session, e.g. once the feature it
    /// was focused on has been archived.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        let capacity = self.recent.capacity();
        self.started_at = Some(now);
        self.last_activity_at = Some(now);
        self.ended_at = None;
        self.focus = None;
        self.recent = BoundedQueue::new(capacity);
        self.shown = None;
    }

    /// Workflow command of the most recent successful invocation.
    pub fn last_command(&self) -> Option<&str> {
        self.recent
            .iter()
            .rev()
            .find(|r| r.outcome.is_success())
            .map(|r| r.command.as_str())
    }
}
