//! Selection helpers for `engager select` and status reporting.

use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::core::selector::{next_actionable, next_step};
use crate::core::types::{Session, StepKind};
use crate::io::init::EngagerPaths;
use crate::io::session_store::SessionStore;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Nothing left to do for the session.
    Complete,
    /// Next item and the step the executor would run on it.
    Open(SelectedItem),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedItem {
    pub item_id: String,
    pub step: StepKind,
    /// Failed attempts already recorded for that step.
    pub attempts: u32,
}

/// Select the next item from an in-memory session.
pub fn select_item(session: &Session) -> SelectOutcome {
    let Some(item) = next_actionable(session) else {
        return SelectOutcome::Complete;
    };
    match next_step(item) {
        Some(step) => SelectOutcome::Open(SelectedItem {
            item_id: item.item_id.clone(),
            step,
            attempts: item.attempts.get(step),
        }),
        None => SelectOutcome::Complete,
    }
}

/// Load `session_id` from the project's store and select its next item.
pub fn select_from_root(root: &Path, session_id: &str) -> Result<SelectOutcome> {
    let paths = EngagerPaths::new(root);
    let store = SessionStore::open(&paths.sessions_dir)
        .with_context(|| "open session store for selection")?;
    let session = store
        .load(session_id)?
        .ok_or_else(|| anyhow!("no session record for '{session_id}'"))?;
    Ok(select_item(&session))
}
