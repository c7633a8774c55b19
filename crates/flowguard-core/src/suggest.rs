//! Ranks the commands most likely to come next.
//!
//! Candidates are the static workflow-graph successors of the last command,
//! plus the top learned successors. Each scores
//!
//! ```text
//! edge weight + learning_weight * (count / row max) + time-of-day bonus
//! ```
//!
//! and ties keep candidate order: graph declaration order first, then learned
//! successors by count. The engine only reads state; learned counts change
//! through the event bus when a shown suggestion is actually taken.

use crate::config::{CommandTag, Settings};
use crate::invocation::IntentKind;
use crate::state::WorkflowState;
use crate::types::FeatureStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub command: String,
    pub score: f64,
    pub rationale: String,
}

struct Candidate {
    command: String,
    graph: f64,
    learned: f64,
    learned_count: u64,
    time_bonus: f64,
    time_label: Option<&'static str>,
}

impl Candidate {
    fn new(command: &str, graph: f64) -> Self {
        Self {
            command: command.to_string(),
            graph,
            learned: 0.0,
            learned_count: 0,
            time_bonus: 0.0,
            time_label: None,
        }
    }

    fn score(&self) -> f64 {
        self.graph + self.learned + self.time_bonus
    }

    /// Names the term that contributed most; later terms win ties.
    fn rationale(&self, after: &str) -> String {
        let mut terms = vec![(self.graph, format!("next step after {after} in the workflow"))];
        if self.learned_count > 0 {
            terms.push((
                self.learned,
                format!("you chose this after {after} {} time(s)", self.learned_count),
            ));
        }
        if let Some(label) = self.time_label {
            terms.push((self.time_bonus, format!("{label} session routine")));
        }
        terms
            .into_iter()
            .fold(None::<(f64, String)>, |best, t| match best {
                Some(b) if b.0 > t.0 => Some(b),
                _ => Some(t),
            })
            .map(|(_, text)| text)
            .unwrap_or_default()
    }
}

pub struct SuggestionEngine<'a> {
    settings: &'a Settings,
}

impl<'a> SuggestionEngine<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Ranked next commands after `last` (defaults to the last successful
    /// command in the session). `hour` is the local hour, 0-23.
    pub fn suggest(&self, state: &WorkflowState, last: Option<&str>, hour: u32) -> Vec<Suggestion> {
        let Some(after) = Self::anchor(state, last) else {
            return vec![Suggestion {
                command: "start_feature".to_string(),
                score: 1.0,
                rationale: "no work in progress".to_string(),
            }];
        };

        let mut candidates: Vec<Candidate> = Vec::new();
        for edge in self.settings.workflow.successors(&after) {
            if !candidates.iter().any(|c| c.command == edge.command) {
                candidates.push(Candidate::new(&edge.command, edge.weight));
            }
        }

        if self.settings.learning_enabled {
            let cfg = &self.settings.suggestions;
            let max = state.learned.row_max(&after);
            for (to, count) in state.learned.top_k(&after, cfg.learned_top_k) {
                let weight = cfg.learning_weight * (count as f64 / max.max(1) as f64);
                let idx = match candidates.iter().position(|c| c.command == to) {
                    Some(i) => i,
                    None => {
                        candidates.push(Candidate::new(to, 0.0));
                        candidates.len() - 1
                    }
                };
                candidates[idx].learned = weight;
                candidates[idx].learned_count = count;
            }
        }

        self.apply_time_of_day(&mut candidates, hour);
        candidates.retain(|c| self.is_applicable(state, &c.command));

        // Stable sort keeps declaration order among equal scores.
        candidates.sort_by(|a, b| b.score().total_cmp(&a.score()));
        candidates.truncate(self.settings.suggestion_count);

        candidates
            .into_iter()
            .map(|c| Suggestion {
                rationale: c.rationale(&after),
                score: c.score(),
                command: c.command,
            })
            .collect()
    }

    /// The command suggestions are ranked after. With no history, an open
    /// feature means picking work back up; with neither there is no anchor.
    pub fn anchor(state: &WorkflowState, last: Option<&str>) -> Option<String> {
        match last.or_else(|| state.session.last_command()) {
            Some(c) => Some(c.to_string()),
            None if state.active_feature.is_some() => Some("resume".to_string()),
            None => None,
        }
    }

    fn apply_time_of_day(&self, candidates: &mut [Candidate], hour: u32) {
        let cfg = &self.settings.suggestions;
        let (tag, label) = if cfg.morning.contains(hour) {
            (CommandTag::Resume, "morning")
        } else if cfg.evening.contains(hour) {
            (CommandTag::Checkpoint, "evening")
        } else {
            return;
        };
        for c in candidates.iter_mut() {
            if self.settings.workflow.tags_for(&c.command).contains(&tag) {
                c.time_bonus = cfg.time_of_day_bonus;
                c.time_label = Some(label);
            }
        }
    }

    /// Drop commands that would certainly be refused in the current state.
    fn is_applicable(&self, state: &WorkflowState, command: &str) -> bool {
        let has_active = state.active_feature.is_some();
        match IntentKind::resolve(command, self.settings) {
            IntentKind::CompleteFeature
            | IntentKind::BlockFeature
            | IntentKind::GenerateTasks
            | IntentKind::UpdateTask
            | IntentKind::ReopenTask => has_active,
            IntentKind::UnblockFeature => state
                .features
                .values()
                .any(|f| f.status == FeatureStatus::Blocked),
            IntentKind::ArchiveFeature => state
                .features
                .values()
                .any(|f| f.status == FeatureStatus::Completed),
            _ => true,
        }
    }
}
