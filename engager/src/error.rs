//! Error taxonomy for run control, the run-loop, and individual steps.

use std::time::Duration;

use thiserror::Error;

use crate::io::generator::GenerationError;

/// Structural run-control errors, returned synchronously to the caller.
/// They never change the run state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("no session record for '{0}'")]
    NoSession(String),
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error("no run is in progress")]
    NotRunning,
    #[error("the run is not paused")]
    NotPaused,
    #[error("state store failure: {0}")]
    Store(String),
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Store(format!("{err:#}"))
    }
}

impl ControlError {
    /// Stable code reported over external interfaces.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::NoSession(_) => "NoSession",
            ControlError::AlreadyRunning => "AlreadyRunning",
            ControlError::NotRunning => "NotRunning",
            ControlError::NotPaused => "NotPaused",
            ControlError::Store(_) => "StoreError",
        }
    }
}

/// Step-level failures. They are recorded on the item and the run
/// continues.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("actuator error: {0}")]
    Actuator(String),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("{what} timed out after {}s", .after.as_secs())]
    Timeout { what: &'static str, after: Duration },
    #[error("{0}")]
    Structural(String),
}

impl ActionError {
    pub fn actuator(err: anyhow::Error) -> Self {
        ActionError::Actuator(format!("{err:#}"))
    }

    /// Failures that retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ActionError::Structural(_))
    }
}

/// Session-level failures. Fatal for the run-loop, which moves the run to
/// `error`.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("no active session")]
    NoActiveSession,
    #[error("session record '{0}' is missing")]
    MissingSessionRecord(String),
    #[error("item '{item_id}' is missing from session '{session_id}'")]
    MissingItem { session_id: String, item_id: String },
    #[error("no actuation surface bound to session '{0}'")]
    NoSurface(String),
    #[error("state update rejected: {0}")]
    Invariant(String),
    #[error("state store failure: {0:#}")]
    Store(anyhow::Error),
    #[error("step panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::Store(err)
    }
}
