//! Deterministic scan policy over a session's work queue.

use serde::Serialize;

use crate::core::types::{Relation, Session, StepKind, StepStatus, WorkItem};

/// Return the first item in stored order that still has a step to run.
///
/// Returns `None` when the pipeline is exhausted for this session.
pub fn next_actionable(session: &Session) -> Option<&WorkItem> {
    session.items.iter().find(|item| next_step(item).is_some())
}

/// The step the executor should run next on `item`, in pipeline priority:
/// classify, primary, response, secondary.
pub fn next_step(item: &WorkItem) -> Option<StepKind> {
    if item.origin_relation == Relation::Unknown {
        return Some(StepKind::Classify);
    }
    if item.primary_status.is_pending() {
        return Some(StepKind::Primary);
    }
    if item.response_status.is_pending() {
        return Some(StepKind::Response);
    }
    if item.origin_relation == Relation::Related && item.secondary_status.is_pending() {
        return Some(StepKind::Secondary);
    }
    None
}

/// True when no step remains for `item` under the default policy.
pub fn is_complete(item: &WorkItem) -> bool {
    next_step(item).is_none()
}

/// Per-step tallies for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepTally {
    pub pending: usize,
    pub done: usize,
    pub failed: usize,
}

impl StepTally {
    fn record(&mut self, status: StepStatus) {
        match status {
            StepStatus::Pending => self.pending += 1,
            StepStatus::Done => self.done += 1,
            StepStatus::Failed => self.failed += 1,
        }
    }
}

/// Queue overview for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub total: usize,
    pub complete: usize,
    pub unclassified: usize,
    pub related: usize,
    pub primary: StepTally,
    pub response: StepTally,
    /// Only counts related items; secondary never runs for the others.
    pub secondary: StepTally,
}

pub fn summarize(session: &Session) -> QueueSummary {
    let mut summary = QueueSummary {
        total: session.items.len(),
        ..QueueSummary::default()
    };
    for item in &session.items {
        if is_complete(item) {
            summary.complete += 1;
        }
        match item.origin_relation {
            Relation::Unknown => summary.unclassified += 1,
            Relation::Related => {
                summary.related += 1;
                summary.secondary.record(item.secondary_status);
            }
            Relation::Unrelated => {}
        }
        summary.primary.record(item.primary_status);
        summary.response.record(item.response_status);
    }
    summary
}
