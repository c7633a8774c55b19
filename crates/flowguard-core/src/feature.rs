use crate::error::{GuardError, Result};
use crate::types::{FeatureEvent, FeatureStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: FeatureStatus,
    pub to: FeatureStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// A unit of work tracked from planning to archival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub branch_name: String,
    pub status: FeatureStatus,
    pub ledger_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_issue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_ref: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub files_touched: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<StatusChange>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Feature {
    /// A new `Planned` feature. The branch defaults to `feature/<id>` and the
    /// ledger shares the feature's id.
    pub fn new(id: impl Into<String>, branch: Option<String>, at: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            branch_name: branch.unwrap_or_else(|| format!("feature/{id}")),
            ledger_id: id.clone(),
            id,
            status: FeatureStatus::Planned,
            linked_issue: None,
            test_ref: None,
            files_touched: BTreeSet::new(),
            blocked_reason: None,
            created_at: at,
            last_transition_at: at,
            history: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// The status `event` would lead to, or `InvalidTransition`.
    pub fn check(&self, event: FeatureEvent) -> Result<FeatureStatus> {
        self.status
            .next(event)
            .ok_or_else(|| GuardError::InvalidTransition {
                feature: self.id.clone(),
                from: self.status.to_string(),
                event: event.to_string(),
            })
    }

    /// Apply `event`, recording the change. Illegal events leave the feature
    /// untouched.
    pub fn apply_event(
        &mut self,
        event: FeatureEvent,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let to = self.check(event)?;
        self.blocked_reason = match to {
            FeatureStatus::Blocked => Some(reason.clone().unwrap_or_else(|| "blocked".to_string())),
            _ => None,
        };
        self.history.push(StatusChange {
            from: self.status,
            to,
            at,
            reason,
            extra: BTreeMap::new(),
        });
        self.status = to;
        self.last_transition_at = at;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == FeatureStatus::Active
    }

    /// When the feature reached `Completed`, if it has.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        if self.status != FeatureStatus::Completed {
            return None;
        }
        Some(self.last_transition_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_feature_is_planned() {
        let f = Feature::new("auth", None, Utc::now());
        assert_eq!(f.status, FeatureStatus::Planned);
        assert_eq!(f.branch_name, "feature/auth");
        assert_eq!(f.ledger_id, "auth");
    }

    #[test]
    fn full_lifecycle_records_history() {
        let mut f = Feature::new("auth", Some("wip/auth".to_string()), Utc::now());
        f.apply_event(FeatureEvent::Start, None, Utc::now()).unwrap();
        f.apply_event(FeatureEvent::Block, Some("waiting on review".into()), Utc::now())
            .unwrap();
        assert_eq!(f.blocked_reason.as_deref(), Some("waiting on review"));
        f.apply_event(FeatureEvent::Unblock, None, Utc::now()).unwrap();
        assert!(f.blocked_reason.is_none());
        f.apply_event(FeatureEvent::Complete, None, Utc::now()).unwrap();
        assert!(f.completed_at().is_some());
        f.apply_event(FeatureEvent::Archive, None, Utc::now()).unwrap();
        assert_eq!(f.status, FeatureStatus::Archived);
        assert_eq!(f.history.len(), 5);
        assert_eq!(f.history[1].to, FeatureStatus::Blocked);
    }

    #[test]
    fn illegal_event_leaves_feature_untouched() {
        let mut f = Feature::new("auth", None, Utc::now());
        let before = f.clone();
        let err = f
            .apply_event(FeatureEvent::Complete, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, GuardError::InvalidTransition { .. }));
        assert_eq!(f, before);
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let yaml = r#"
id: auth
branch_name: feature/auth
status: active
ledger_id: auth
created_at: 2026-01-01T00:00:00Z
last_transition_at: 2026-01-01T00:00:00Z
owner: dana
"#;
        let f: Feature = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(f.extra.get("owner").and_then(|v| v.as_str()), Some("dana"));
        let out = serde_yaml::to_string(&f).unwrap();
        assert!(out.contains("owner: dana"));
    }
}
