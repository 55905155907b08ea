//! Engine-owned transitions applied to a work item after one step.
//!
//! Every function here mutates a single item in memory; persistence and
//! broadcasting are the caller's job.

use chrono::{DateTime, Utc};

use crate::core::types::{Relation, StepKind, StepStatus, WorkItem};

/// Message recorded when the generator declines to act on an item.
pub const SKIPPED_BY_POLICY: &str = "Skipped by generation policy";

/// Successful result of a status-bearing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEffect {
    /// The action went through; `generated` is the text that was sent, if any.
    Completed { generated: Option<String> },
    /// The generator returned the skip sentinel.
    Skipped,
}

/// What a failure did to the item's step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Still pending; the scan policy will pick it up again.
    Retry { attempts: u32, max_attempts: u32 },
    /// Attempts exhausted (or the failure is permanent); step is `failed`.
    Exhausted { attempts: u32 },
}

/// Record the classify outcome. A failed classification falls back to
/// `Unrelated` so the pipeline can move on without a secondary message.
pub fn apply_classification(
    item: &mut WorkItem,
    outcome: Result<Relation, String>,
    now: DateTime<Utc>,
) -> Relation {
    let relation = match outcome {
        Ok(Relation::Unknown) => {
            item.attempts.classify += 1;
            item.last_error = Some("classification returned unknown".to_string());
            Relation::Unrelated
        }
        Ok(relation) => {
            item.last_error = None;
            relation
        }
        Err(message) => {
            item.attempts.classify += 1;
            item.last_error = Some(message);
            Relation::Unrelated
        }
    };
    item.origin_relation = relation;
    item.timestamps.classified_at = Some(now);
    relation
}

/// Mark a status-bearing step `done`.
pub fn apply_step_success(
    item: &mut WorkItem,
    step: StepKind,
    effect: StepEffect,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let current = item.status(step);
    if step != StepKind::Classify && !current.is_pending() {
        return Err(format!(
            "step '{step}' on item '{}' is already {current:?}",
            item.item_id
        ));
    }
    let status = item
        .status_mut(step)
        .ok_or_else(|| format!("step '{step}' has no status field"))?;
    *status = StepStatus::Done;
    *item.timestamps.completion_mut(step) = Some(now);

    match effect {
        StepEffect::Completed { generated } => {
            item.last_error = None;
            match step {
                StepKind::Response => item.generated_response = generated,
                StepKind::Secondary => item.generated_secondary_message = generated,
                StepKind::Classify | StepKind::Primary => {}
            }
        }
        StepEffect::Skipped => {
            item.last_error = Some(SKIPPED_BY_POLICY.to_string());
        }
    }
    Ok(())
}

/// Count a failed attempt and mark the step `failed` once attempts are
/// exhausted. Permanent failures are exhausted immediately.
pub fn apply_step_failure(
    item: &mut WorkItem,
    step: StepKind,
    message: &str,
    max_attempts: u32,
    permanent: bool,
) -> Result<FailureDisposition, String> {
    if step == StepKind::Classify {
        return Err(format!("step '{step}' has no status field"));
    }
    if !item.status(step).is_pending() {
        return Err(format!("step '{step}' is not pending"));
    }
    let attempts = {
        let counter = item.attempts.get_mut(step);
        *counter = counter.saturating_add(1);
        *counter
    };
    item.last_error = Some(message.to_string());

    let Some(status) = item.status_mut(step) else {
        return Err(format!("step '{step}' has no status field"));
    };
    if permanent || attempts >= max_attempts {
        *status = StepStatus::Failed;
        return Ok(FailureDisposition::Exhausted { attempts });
    }
    Ok(FailureDisposition::Retry {
        attempts,
        max_attempts,
    })
}
