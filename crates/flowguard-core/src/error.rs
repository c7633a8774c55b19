use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("not initialized: run 'flowguard init'")]
    NotInitialized,

    #[error("feature not found: {0}")]
    FeatureNotFound(String),

    #[error("invalid feature id '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidFeatureId(String),

    #[error("invalid transition for feature '{feature}' from {from} via {event}")]
    InvalidTransition {
        feature: String,
        from: String,
        event: String,
    },

    #[error("invalid phase: {0}")]
    InvalidPhase(String),

    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("state corruption: {0}")]
    StateCorruption(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error(transparent)]
    TaskLedger(#[from] TaskLedgerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures local to a single task-ledger mutation. Other tasks are untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskLedgerError {
    #[error("task ledger not found: {0}")]
    LedgerNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task} cannot complete: test '{test_ref}' is not passing")]
    TestNotPassing { task: String, test_ref: String },

    #[error("task {task} cannot move from {from} to {to}")]
    IllegalTransition {
        task: String,
        from: String,
        to: String,
    },
}

pub type Result<T> = std::result::Result<T, GuardError>;
