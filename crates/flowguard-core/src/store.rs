use crate::config::Settings;
use crate::error::Result;
use crate::state::{Mutation, WorkflowState};
use std::sync::Arc;

/// Holds the current [`WorkflowState`] behind an `Arc` so readers (policies,
/// the persister, suggestion scoring) work from an immutable snapshot while
/// the single writer builds the next one.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    current: Arc<WorkflowState>,
}

impl StateStore {
    pub fn new(state: WorkflowState) -> Self {
        Self {
            current: Arc::new(state),
        }
    }

    pub fn snapshot(&self) -> Arc<WorkflowState> {
        Arc::clone(&self.current)
    }

    pub fn revision(&self) -> u64 {
        self.current.revision
    }

    /// Apply a batch all-or-nothing. On success the revision is bumped and the
    /// new snapshot published; a batch that changes nothing publishes nothing.
    /// Returns whether a new revision was produced.
    pub fn commit(&mut self, mutations: Vec<Mutation>, settings: &Settings) -> Result<bool> {
        if mutations.is_empty() {
            return Ok(false);
        }
        let mut next = (*self.current).clone();
        for m in mutations {
            next.apply(m, settings)?;
        }
        if next == *self.current {
            return Ok(false);
        }
        next.revision = self.current.revision + 1;
        self.current = Arc::new(next);
        Ok(true)
    }
}
