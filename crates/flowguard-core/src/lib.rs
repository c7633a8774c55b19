pub mod bus;
pub mod config;
pub mod error;
pub mod feature;
pub mod guard;
pub mod invocation;
pub mod io;
pub mod learned;
pub mod mutators;
pub mod paths;
pub mod persist;
pub mod policies;
pub mod policy;
pub mod session;
pub mod state;
pub mod store;
pub mod suggest;
pub mod task;
pub mod types;

pub use bus::{DispatchOutcome, EventBus, HookResponse};
pub use config::Settings;
pub use error::{GuardError, Result, TaskLedgerError};
pub use invocation::ToolInvocation;
pub use state::WorkflowState;
pub use types::{Outcome, Phase, Verdict};
