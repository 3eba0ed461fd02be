use std::sync::Arc;

use thiserror::Error;

use crate::state::Step;
use crate::tree::StateId;

/// Configuration and usage errors.
///
/// These are returned synchronously from the call that caused them
/// (building states, `init`, `transition_to`, `link`, ...). They signal a
/// programmer error and are never routed through lifecycle events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// A sibling (or root) with the same name already exists.
    #[error("state '{0}' is already declared among its siblings")]
    DuplicateState(String),

    /// Two leaf states resolve to the same concrete path.
    #[error("states '{first}' and '{second}' both resolve to path '{path}'")]
    AmbiguousPath {
        first: String,
        second: String,
        path: String,
    },

    /// The tree was already initialized; it no longer accepts structural changes.
    #[error("state tree is already initialized")]
    TreeFrozen,

    /// The operation needs an initialized tree.
    #[error("state tree is not initialized")]
    NotInitialized,

    /// A data key can only be set once per state.
    #[error("data key '{key}' is already set on state '{state}'")]
    DataKeyExists { state: String, key: String },

    /// State names must be non-empty and contain neither `.` nor `/`.
    #[error("invalid state name '{0}'")]
    InvalidName(String),

    /// Malformed path template.
    #[error("invalid path template '{template}': {reason}")]
    InvalidPath { template: String, reason: String },

    /// A param name is declared twice along one ancestor chain.
    #[error("param '{param}' of state '{state}' is already declared by an ancestor")]
    DuplicateParam { state: String, param: String },

    /// No state with this dotted name.
    #[error("unknown state '{0}'")]
    StateNotFound(String),

    /// Transitions can only target leaf states.
    #[error("state '{0}' is not a leaf state")]
    NotALeaf(String),

    /// No leaf route matches the path.
    #[error("no state matches path '{0}'")]
    PathNotFound(String),

    /// A declared path param has no value.
    #[error("missing param '{param}' for state '{state}'")]
    MissingParam { state: String, param: String },

    /// `Router::guard` called while no enter phase is running.
    #[error("async registration is only allowed during an enter callback")]
    NotEntering,
}

/// Failure of a transition after it was accepted.
///
/// Reported through `TransitionOutcome::Failed` and the `failed` event.
#[derive(Error, Debug, Clone)]
pub enum TransitionError {
    /// An `enter_prereqs` / `exit_prereqs` future resolved to an error.
    #[error("prerequisite of state '{state}' failed: {cause:#}")]
    Prerequisite {
        state: String,
        state_id: StateId,
        cause: Arc<anyhow::Error>,
    },

    /// An `enter` / `exit` / `update` callback panicked; the remaining steps
    /// were skipped.
    #[error("{step} callback of state '{state}' panicked: {message}")]
    Callback {
        state: String,
        state_id: StateId,
        step: Step,
        message: String,
    },
}

impl TransitionError {
    /// Full name of the state whose prerequisite failed.
    pub fn state(&self) -> &str {
        match self {
            TransitionError::Prerequisite { state, .. }
            | TransitionError::Callback { state, .. } => state,
        }
    }

    pub fn state_id(&self) -> StateId {
        match self {
            TransitionError::Prerequisite { state_id, .. }
            | TransitionError::Callback { state_id, .. } => *state_id,
        }
    }

    /// The application error behind a prerequisite failure.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            TransitionError::Prerequisite { cause, .. } => Some(cause),
            TransitionError::Callback { .. } => None,
        }
    }
}
